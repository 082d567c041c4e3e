//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (WS_*, REDIS_*) for fields the file leaves out

use anyhow::{Context, Result};
use relay_core::keys::{DEFAULT_IDS_KEY, DEFAULT_PREFIX};
use relay_core::snapshot::DEFAULT_TIMESTAMP_FIELD;
use relay_core::{KeySpace, RedisSettings, RelayConfig};
use relay_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Telemetry domain.
    #[serde(default)]
    pub relay: RelaySection,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A Redis server.
    Redis,
    /// An in-process store, for single-node runs without Redis.
    Memory,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind.
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Redis host.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database index.
    #[serde(default = "default_redis_db")]
    pub db: i64,

    /// Redis password; empty means none.
    #[serde(default = "default_redis_password")]
    pub password: Option<String>,
}

/// Telemetry domain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Channel and hash key prefix (`<prefix>:<id>:data`).
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Set holding every known entity id.
    #[serde(default = "default_ids_key")]
    pub ids_key: String,

    /// Field producers write their timestamp (ms) to.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,

    /// Frames a session may have queued before deliveries are refused.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// Default value functions
fn default_host() -> String {
    env_or("WS_HOST", "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    env_or("WS_PORT", 8080)
}

fn default_backend() -> Backend {
    Backend::Redis
}

fn default_redis_host() -> String {
    env_or("REDIS_HOST", "127.0.0.1".to_string())
}

fn default_redis_port() -> u16 {
    env_or("REDIS_PORT", 6379)
}

fn default_redis_db() -> i64 {
    env_or("REDIS_DB", 0)
}

fn default_redis_password() -> Option<String> {
    std::env::var("REDIS_PASS").ok().filter(|p| !p.is_empty())
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_ids_key() -> String {
    DEFAULT_IDS_KEY.to_string()
}

fn default_timestamp_field() -> String {
    DEFAULT_TIMESTAMP_FIELD.to_string()
}

fn default_queue_capacity() -> usize {
    WebSocketConfig::default().queue_capacity
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store: StoreConfig::default(),
            relay: RelaySection::default(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: default_redis_host(),
            port: default_redis_port(),
            db: default_redis_db(),
            password: default_redis_password(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            ids_key: default_ids_key(),
            timestamp_field: default_timestamp_field(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Redis connection settings.
    #[must_use]
    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            host: self.store.host.clone(),
            port: self.store.port,
            db: self.store.db,
            password: self.store.password.clone(),
        }
    }

    /// Relay settings.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            keys: KeySpace::new(&self.relay.prefix, &self.relay.ids_key),
            timestamp_field: self.relay.timestamp_field.clone(),
        }
    }

    /// Per-session WebSocket settings.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            queue_capacity: self.relay.queue_capacity,
        }
    }
}
