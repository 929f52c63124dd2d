use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, StoreBackend};
use floodgate::ratelimit::ScopeRegistry;
use floodgate::server::HttpServer;
use floodgate::store::{CounterStore, MemoryStore, RedisStore};

/// Distributed request admission control.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file; `FLOODGATE__*` variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve,
    /// Validate the configuration and print the resolved scopes
    Check,
    /// Delete stored counters and blocks for a scope
    Reset {
        #[arg(long)]
        scope: String,
        /// Only this client's keys
        #[arg(long)]
        client: Option<String>,
    },
    /// Show the stored state of one budget key
    Inspect {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        client: String,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        route: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Floodgate {}", env!("CARGO_PKG_VERSION"));

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    info!(
        backend = ?config.store.backend,
        store = %config.store.url,
        scopes = config.rate_limiting.scopes.len(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Check => check(&config),
        Command::Serve => serve(config).await,
        Command::Reset { scope, client } => {
            let registry = connect(&config).await?;
            let limiter = registry
                .get(&scope)
                .ok_or_else(|| anyhow::anyhow!("unknown scope `{}`", scope))?;

            let deleted = limiter.reset(client.as_deref()).await?;
            println!("{}", json!({ "scope": scope, "deleted": deleted }));
            Ok(())
        }
        Command::Inspect {
            scope,
            client,
            method,
            route,
        } => {
            let registry = connect(&config).await?;
            let limiter = registry
                .get(&scope)
                .ok_or_else(|| anyhow::anyhow!("unknown scope `{}`", scope))?;

            let key = limiter.key_for(&client, &method, &route);
            let usage = limiter.inspect(&key).await?;
            let report = json!({
                "key": key.to_string(),
                "limit": limiter.policy().limit(),
                "count": usage.count,
                "window_ttl_ms": usage.window_ttl_ms,
                "block_ttl_ms": usage.block_ttl_ms,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn check(config: &FloodgateConfig) -> anyhow::Result<()> {
    let rate_limiting = &config.rate_limiting;
    println!(
        "rate limiting {} (fail_open: {})",
        if rate_limiting.enabled { "enabled" } else { "disabled" },
        rate_limiting.fail_open
    );

    for rule in &rate_limiting.scopes {
        println!(
            "  {:<12} {:>6} per {:>8}ms  {:<12} prefix={} fail_open={} enabled={}",
            rule.name,
            rule.limit,
            rule.window_ms,
            rule.strategy,
            rule.key_prefix,
            rule.fail_open.unwrap_or(rate_limiting.fail_open),
            rule.enabled && rate_limiting.enabled,
        );
    }
    Ok(())
}

async fn connect(config: &FloodgateConfig) -> anyhow::Result<ScopeRegistry> {
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => {
            let store =
                RedisStore::connect(&config.store.url, config.store.connection_count).await?;
            info!("Counter store connected");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory counter store; budgets are not shared across processes");
            let store = Arc::new(MemoryStore::new());
            store.spawn_purge(config.store.purge_interval());
            store
        }
    };

    Ok(ScopeRegistry::from_config(config, store)?)
}

async fn serve(config: FloodgateConfig) -> anyhow::Result<()> {
    let registry = connect(&config).await?;
    info!(scopes = registry.len(), "Scope limiters initialized");

    let server = HttpServer::new(
        config.server.http_addr,
        &registry,
        config.rate_limiting.trust_proxy_headers,
    );

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
