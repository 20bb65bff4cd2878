//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (`HPMON_URL`)
//! - The `[client]` table of an `hpmon.toml` file
//!
//! Per-call overrides go through [`ConnectOptions`].

use hpmon_protocol::Encoding;
use hpmon_transport::{ReconnectPolicy, TransportKind, WebSocketConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Files searched by [`ClientConfig::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "hpmon.toml",
    "/etc/hpmon/hpmon.toml",
    "~/.config/hpmon/hpmon.toml",
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Realtime client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint.
    #[serde(default = "default_url")]
    pub url: String,

    /// Transport preference, most preferred first.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    /// Reconnection behavior.
    #[serde(default)]
    pub reconnection: ReconnectionConfig,

    /// Window within which metric updates are merged into one notification.
    #[serde(default = "default_debounce_ms")]
    pub metric_debounce_ms: u64,

    /// Encoding for outbound frames.
    #[serde(default)]
    pub encoding: Encoding,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// What `hpmon-tail` subscribes to.
    #[serde(default)]
    pub tail: TailConfig,
}

/// Reconnection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Reconnect automatically.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts before giving up.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Initial delay in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: u64,

    /// Random deviation applied to each delay, as a fraction of it.
    #[serde(default = "default_randomization")]
    pub randomization_factor: f64,
}

/// Subscriptions used by the tail CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailConfig {
    /// Metrics to subscribe to.
    #[serde(default)]
    pub metrics: Vec<String>,

    /// Dashboard to watch.
    #[serde(default)]
    pub dashboard_id: Option<String>,
}

// Default value functions
fn default_url() -> String {
    std::env::var("HPMON_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string())
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::WebSocket, TransportKind::Polling]
}

fn default_true() -> bool {
    true
}

fn default_attempts() -> u32 {
    10
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_delay_max_ms() -> u64 {
    30_000
}

fn default_randomization() -> f64 {
    0.5
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            transports: default_transports(),
            reconnection: ReconnectionConfig::default(),
            metric_debounce_ms: default_debounce_ms(),
            encoding: Encoding::default(),
            max_message_size: default_max_message_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tail: TailConfig::default(),
        }
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
            delay_max_ms: default_delay_max_ms(),
            randomization_factor: default_randomization(),
        }
    }
}

/// Shape of `hpmon.toml` as seen by the client.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    client: ClientConfig,
}

impl ClientConfig {
    /// Load the `[client]` table from the first config file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load the `[client]` table from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse the `[client]` table out of TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML error if the text does not parse.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(contents)?;
        Ok(file.client)
    }

    /// Debounce window as a duration.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.metric_debounce_ms)
    }

    /// Settings for the built-in WebSocket transport.
    #[must_use]
    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.max_message_size,
            encoding: self.encoding,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// Per-call overrides for [`RealtimeClient::connect`](crate::RealtimeClient::connect).
///
/// Every field left `None` falls back to the client configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub transports: Option<Vec<TransportKind>>,
    pub reconnection: Option<bool>,
    pub reconnection_attempts: Option<u32>,
    pub reconnection_delay: Option<Duration>,
    pub reconnection_delay_max: Option<Duration>,
    pub randomization_factor: Option<f64>,
}

impl ConnectOptions {
    /// Transport preference after applying overrides.
    #[must_use]
    pub fn transports(&self, config: &ClientConfig) -> Vec<TransportKind> {
        self.transports
            .clone()
            .unwrap_or_else(|| config.transports.clone())
    }

    /// Reconnect policy after applying overrides.
    #[must_use]
    pub fn policy(&self, config: &ClientConfig) -> ReconnectPolicy {
        let defaults = &config.reconnection;
        ReconnectPolicy {
            enabled: self.reconnection.unwrap_or(defaults.enabled),
            max_attempts: self.reconnection_attempts.unwrap_or(defaults.attempts),
            delay_initial: self
                .reconnection_delay
                .unwrap_or(Duration::from_millis(defaults.delay_ms)),
            delay_max: self
                .reconnection_delay_max
                .unwrap_or(Duration::from_millis(defaults.delay_max_ms)),
            randomization: self
                .randomization_factor
                .unwrap_or(defaults.randomization_factor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(
            config.transports,
            vec![TransportKind::WebSocket, TransportKind::Polling]
        );
        assert_eq!(config.metric_debounce_ms, 100);
        assert_eq!(config.reconnection, ReconnectionConfig::default());
        assert_eq!(config.reconnection.attempts, 10);
    }

    #[test]
    fn test_default_policy() {
        let config = ClientConfig::default();
        let policy = ConnectOptions::default().policy(&config);

        assert_eq!(policy, ReconnectPolicy::default());
    }

    #[test]
    fn test_options_override_only_set_fields() {
        let config = ClientConfig::default();
        let options = ConnectOptions {
            reconnection_attempts: Some(3),
            transports: Some(vec![TransportKind::Polling]),
            ..ConnectOptions::default()
        };

        let policy = options.policy(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_initial, Duration::from_millis(1000));
        assert_eq!(policy.delay_max, Duration::from_millis(30_000));
        assert_eq!(options.transports(&config), vec![TransportKind::Polling]);
    }

    #[test]
    fn test_client_table_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"

            [client]
            url = "ws://heatpump.local:8080/ws"
            metric_debounce_ms = 250
            transports = ["websocket"]

            [client.reconnection]
            attempts = 5

            [client.tail]
            metrics = ["temp_outside", "temp_flow"]
            dashboard_id = "main"
        "#;

        let config = ClientConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.url, "ws://heatpump.local:8080/ws");
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.transports, vec![TransportKind::WebSocket]);
        assert_eq!(config.reconnection.attempts, 5);
        assert_eq!(config.reconnection.delay_ms, 1000);
        assert_eq!(config.tail.metrics, vec!["temp_outside", "temp_flow"]);
        assert_eq!(config.tail.dashboard_id.as_deref(), Some("main"));
    }

    #[test]
    fn test_missing_client_table_uses_defaults() {
        let config = ClientConfig::from_toml("port = 9000").unwrap();
        assert_eq!(config.metric_debounce_ms, 100);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = ClientConfig::from_file("/nonexistent/hpmon.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
