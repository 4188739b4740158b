//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/activity-relay/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/activity-relay/` (~/.config/activity-relay/)
//! - Data: `$XDG_DATA_HOME/activity-relay/` (~/.local/share/activity-relay/)
//! - State/Logs: `$XDG_STATE_HOME/activity-relay/` (~/.local/state/activity-relay/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "activity-relay";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collector endpoints and transport timeouts
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Batch cadence and retry bookkeeping
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Stream reconnect policy
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Reachability polling
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Local event store
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how batches reach the collector
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// WebSocket endpoint for the persistent stream
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Endpoint that accepts `POST`ed batches
    #[serde(default = "default_http_url")]
    pub http_url: String,

    /// Disable to deliver over the request path only
    #[serde(default = "default_true")]
    pub stream_enabled: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time allowed for a single stream frame to be written
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Agent identity reported in every batch
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            http_url: default_http_url(),
            stream_enabled: true,
            request_timeout_secs: default_request_timeout(),
            send_timeout_secs: default_send_timeout(),
            agent_name: default_agent_name(),
        }
    }
}

impl CollectorConfig {
    /// HTTP request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Stream send timeout
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn default_stream_url() -> String {
    "ws://127.0.0.1:5000/ws".to_string()
}

fn default_http_url() -> String {
    "http://127.0.0.1:5000/events".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    5
}

fn default_agent_name() -> String {
    format!(
        "activity-relay/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Delivery cycle configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Seconds between scheduled delivery cycles
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Maximum events per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Consecutive failures of one batch before it stops being tracked
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            batch_size: default_batch_size(),
            retry_limit: default_retry_limit(),
        }
    }
}

impl DeliveryConfig {
    /// Interval between scheduled cycles
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_flush_interval() -> u64 {
    15
}

fn default_batch_size() -> usize {
    200
}

fn default_retry_limit() -> u32 {
    3
}

/// Reconnect backoff for the persistent stream
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Upper bound on any reconnect delay in milliseconds
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_ms: u64,

    /// Scheduled reconnects allowed before giving up until connectivity returns
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base(),
            reconnect_cap_ms: default_reconnect_cap(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_reconnect_base() -> u64 {
    1000
}

fn default_reconnect_cap() -> u64 {
    30000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

/// Reachability polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// Seconds between reachability probes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl ConnectivityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

/// Local event store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Database path override
    pub path: Option<PathBuf>,

    /// Retention bound; the oldest events are evicted past this count
    #[serde(default = "default_max_events")]
    pub max_events: u64,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Upper bound on one store call made from the delivery pipeline
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_events: default_max_events(),
            busy_timeout_ms: default_busy_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl StoreConfig {
    /// SQLite busy timeout
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Store operation timeout for the async pipeline
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn default_max_events() -> u64 {
    100_000
}

fn default_busy_timeout() -> u64 {
    2000
}

fn default_operation_timeout() -> u64 {
    10
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.delivery.batch_size == 0 {
            return Err(Error::Config(
                "delivery.batch_size must be at least 1".to_string(),
            ));
        }
        if self.delivery.flush_interval_secs == 0 {
            return Err(Error::Config(
                "delivery.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.delivery.retry_limit == 0 {
            return Err(Error::Config(
                "delivery.retry_limit must be at least 1".to_string(),
            ));
        }
        if self.connection.reconnect_base_ms == 0 {
            return Err(Error::Config(
                "connection.reconnect_base_ms must be at least 1".to_string(),
            ));
        }
        if self.connection.reconnect_base_ms > self.connection.reconnect_cap_ms {
            return Err(Error::Config(
                "connection.reconnect_base_ms must not exceed connection.reconnect_cap_ms"
                    .to_string(),
            ));
        }
        if self.store.max_events == 0 {
            return Err(Error::Config(
                "store.max_events must be at least 1".to_string(),
            ));
        }
        for (key, secs) in [
            ("collector.request_timeout_secs", self.collector.request_timeout_secs),
            ("collector.send_timeout_secs", self.collector.send_timeout_secs),
            ("connection.connect_timeout_secs", self.connection.connect_timeout_secs),
            ("store.operation_timeout_secs", self.store.operation_timeout_secs),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("{} must be at least 1", key)));
            }
        }
        for (key, value) in [
            ("collector.stream_url", &self.collector.stream_url),
            ("collector.http_url", &self.collector.http_url),
        ] {
            reqwest::Url::parse(value)
                .map_err(|e| Error::Config(format!("{} is not a valid URL: {}", key, e)))?;
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/activity-relay/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the data directory path (for the SQLite event store)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the default event store path
    ///
    /// `$XDG_DATA_HOME/activity-relay/events.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("events.db")
    }

    /// Returns the store path, honouring `store.path`
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
