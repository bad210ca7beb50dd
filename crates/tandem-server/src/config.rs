//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TANDEM_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
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

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Swap lifecycle configuration.
    #[serde(default)]
    pub swap: SwapConfig,

    /// Credential and principal seed data for the in-memory backends.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Opening credit balances, keyed by principal.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Catalog titles for notification enrichment.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Maximum joined channels per connection.
    #[serde(default = "default_max_joins")]
    pub max_joins_per_connection: usize,

    /// Channel broadcast capacity.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
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

/// Swap lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SwapConfig {
    /// Reserved: expiry for stale pending requests. No sweep runs yet; a
    /// configured value is accepted and logged so deployments can set it
    /// ahead of the feature.
    #[serde(default)]
    pub pending_ttl_secs: Option<u64>,
}

/// Static credential map for the in-memory verifier: token -> principal.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: HashMap<String, String>,

    /// Display names, keyed by principal.
    #[serde(default)]
    pub profiles: HashMap<String, String>,
}

/// Opening balances for the in-memory ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerConfig {
    #[serde(default)]
    pub balances: HashMap<String, i64>,
}

/// Catalog seed data. Keys are numeric ids as strings (TOML map keys).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    #[serde(default)]
    pub skills: HashMap<String, String>,

    #[serde(default)]
    pub workshops: HashMap<String, String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TANDEM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TANDEM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_max_channels() -> usize {
    10_000
}

fn default_max_joins() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            swap: SwapConfig::default(),
            auth: AuthConfig::default(),
            ledger: LedgerConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            max_joins_per_connection: default_max_joins(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
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
            "tandem.toml",
            "/etc/tandem/tandem.toml",
            "~/.config/tandem/tandem.toml",
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
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert!(config.metrics.enabled);
        assert!(config.swap.pending_ttl_secs.is_none());
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_channels = 50000

            [auth.tokens]
            "tok-alice" = "alice"

            [ledger.balances]
            alice = 120
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_channels, 50000);
        assert_eq!(config.auth.tokens.get("tok-alice").unwrap(), "alice");
        assert_eq!(config.ledger.balances.get("alice"), Some(&120));
    }
}
