//! HTTP server hosting the gated demo API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::gate::AdmissionGate;
use crate::ratelimit::{ScopeLimiter, ScopeRegistry};

/// Scope guarding every `/api` route.
pub const API_SCOPE: &str = "api";
/// Scope guarding credential endpoints.
pub const AUTH_SCOPE: &str = "auth";
/// Scope guarding account creation.
pub const SIGNUP_SCOPE: &str = "signup";

/// Build the demo router with gates from `registry`.
///
/// A scope missing from the registry leaves its routes unlimited.
pub fn router(registry: &ScopeRegistry, trust_proxy_headers: bool) -> Router {
    let gate = |scope: &str| -> Option<AdmissionGate> {
        let limiter = lookup(registry, scope)?;
        Some(AdmissionGate::new(limiter).trust_proxy_headers(trust_proxy_headers))
    };

    let api = Router::new()
        .route("/users/:id", get(get_user))
        .route("/users", gated(post(create_user), gate(SIGNUP_SCOPE)))
        .route("/auth/login", gated(post(login), gate(AUTH_SCOPE)));

    let api = match gate(API_SCOPE) {
        Some(gate) => api.layer(gate.layer()),
        None => api,
    };

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
}

fn lookup(registry: &ScopeRegistry, scope: &str) -> Option<Arc<ScopeLimiter>> {
    let limiter = registry.get(scope);
    if limiter.is_none() {
        warn!(scope, "No rule configured for scope, routes left unlimited");
    }
    limiter
}

fn gated(route: MethodRouter, gate: Option<AdmissionGate>) -> MethodRouter {
    match gate {
        Some(gate) => route.layer(gate.layer()),
        None => route,
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn get_user(Path(id): Path<String>) -> impl IntoResponse {
    Json(json!({ "id": id }))
}

async fn create_user() -> impl IntoResponse {
    (StatusCode::CREATED, Json(json!({ "success": true })))
}

async fn login() -> impl IntoResponse {
    Json(json!({ "success": true }))
}

/// HTTP server for the gated API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Router with gates attached
    router: Router,
}

impl HttpServer {
    /// Create a server for `registry` bound to `addr`.
    pub fn new(addr: SocketAddr, registry: &ScopeRegistry, trust_proxy_headers: bool) -> Self {
        Self {
            addr,
            router: router(registry, trust_proxy_headers),
        }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
