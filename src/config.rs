//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{validate_rules, ScopeRule};

/// Environment variable prefix for overrides, e.g. `FLOODGATE__STORE__URL`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Shared Redis; budgets hold across every server process
    #[default]
    Redis,
    /// Process memory; budgets are per process
    Memory,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URL; host, port, credentials and database index all live here
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Bound on each store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of managed connections used round-robin
    #[serde(default = "default_connection_count")]
    pub connection_count: usize,

    /// How often the memory backend drops expired counters, in milliseconds
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
            connection_count: default_connection_count(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The memory backend's purge interval.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_store_timeout_ms() -> u64 {
    200
}

fn default_connection_count() -> usize {
    1
}

fn default_purge_interval_ms() -> u64 {
    60_000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Master switch; when off every gate passes requests straight through
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admit requests while the store is unreachable (per-scope overridable)
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Retry-After handed out while failing closed
    #[serde(default = "default_fail_closed_retry_after")]
    pub fail_closed_retry_after_secs: u64,

    /// Prefer `X-Forwarded-For` / `X-Real-IP` over the socket address
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Scope rules
    #[serde(default)]
    pub scopes: Vec<ScopeRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
            fail_closed_retry_after_secs: default_fail_closed_retry_after(),
            trust_proxy_headers: false,
            scopes: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fail_closed_retry_after() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Parse a standalone rate limiting section from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitingConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit config: {}", e)))?;
        validate_rules(&config.scopes)?;
        Ok(config)
    }

    /// Look up a scope rule by name.
    pub fn scope(&self, name: &str) -> Option<&ScopeRule> {
        self.scopes.iter().find(|s| s.name == name)
    }
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `FLOODGATE__*` environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would leave the service limiting nothing or
    /// hanging on the store.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.store.connection_count == 0 {
            return Err(FloodgateError::Config(
                "store.connection_count must be > 0".to_string(),
            ));
        }
        if self.store.purge_interval_ms == 0 {
            return Err(FloodgateError::Config(
                "store.purge_interval_ms must be > 0".to_string(),
            ));
        }
        validate_rules(&self.rate_limiting.scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Strategy;

    const SAMPLE: &str = r#"
server:
  http_addr: 0.0.0.0:3000
store:
  url: redis://cache:6379/2
  timeout_ms: 150
rate_limiting:
  fail_open: true
  scopes:
    - name: api
      limit: 100
      window_ms: 900000
    - name: login
      limit: 5
      window_ms: 900000
      strategy: block
      block_duration_ms: 1800000
      fail_open: false
"#;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(config.server.http_addr, default_http_addr());
        assert_eq!(config.store.timeout(), Duration::from_millis(200));
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.purge_interval(), Duration::from_secs(60));
        assert!(config.rate_limiting.enabled);
        assert!(config.rate_limiting.fail_open);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = FloodgateConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.server.http_addr.port(), 3000);
        assert_eq!(config.store.url, "redis://cache:6379/2");
        assert_eq!(config.store.connection_count, 1);
        assert_eq!(config.rate_limiting.scopes.len(), 2);

        let login = config.rate_limiting.scope("login").unwrap();
        assert_eq!(login.strategy, Strategy::Block);
        assert_eq!(login.fail_open, Some(false));
        assert!(config.rate_limiting.scope("missing").is_none());
    }

    #[test]
    fn test_invalid_scope_is_fatal() {
        let yaml = r#"
rate_limiting:
  scopes:
    - name: api
      limit: 0
      window_ms: 1000
"#;
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_zero_timeout_is_fatal() {
        let yaml = r#"
store:
  timeout_ms: 0
"#;
        assert!(FloodgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rate_limiting_section_from_yaml() {
        let yaml = r#"
enabled: false
scopes:
  - name: signup
    limit: 3
    window_ms: 3600000
    strategy: block
    block_duration_ms: 7200000
"#;
        let section = RateLimitingConfig::from_yaml(yaml).unwrap();
        assert!(!section.enabled);
        assert!(section.fail_open);
        assert_eq!(section.fail_closed_retry_after_secs, 60);
        assert_eq!(section.scopes[0].name, "signup");
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", rand::random::<u64>()));
        std::fs::write(&path, SAMPLE).unwrap();

        let config = FloodgateConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.timeout_ms, 150);
        assert_eq!(config.rate_limiting.scopes.len(), 2);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_env_overrides_file() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", rand::random::<u64>()));
        std::fs::write(&path, SAMPLE).unwrap();

        // Only fields no other loading test asserts on, since tests share
        // the process environment.
        std::env::set_var("FLOODGATE__STORE__CONNECTION_COUNT", "8");
        std::env::set_var("FLOODGATE__STORE__BACKEND", "memory");
        let config = FloodgateConfig::load(Some(&path));
        std::env::remove_var("FLOODGATE__STORE__CONNECTION_COUNT");
        std::env::remove_var("FLOODGATE__STORE__BACKEND");
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.store.connection_count, 8);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        // Untouched file values survive.
        assert_eq!(config.store.url, "redis://cache:6379/2");
    }

    #[test]
    fn test_zero_purge_interval_is_fatal() {
        let yaml = r#"
store:
  backend: memory
  purge_interval_ms: 0
"#;
        assert!(FloodgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/floodgate.example.yaml");
        let config = FloodgateConfig::from_file(path).unwrap();

        assert_eq!(config.store.connection_count, 4);
        for scope in ["api", "auth", "signup"] {
            assert!(config.rate_limiting.scope(scope).is_some(), "missing {}", scope);
        }
    }
}
