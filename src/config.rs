//! WolfStore Configuration
//!
//! This module provides configuration structures for the WolfStore
//! server daemon and client tool. Both read the same TOML file; each
//! side only looks at its own section.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::MAX_FRAME_SIZE;

/// Main WolfStore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfStoreConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind for client connections
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Directory exposed to clients
    #[serde(default = "default_server_mount")]
    pub mount_path: PathBuf,

    /// Interval between unsolicited catalog snapshots in milliseconds (0 = only on change)
    #[serde(default = "default_callback_interval_ms")]
    pub callback_interval_ms: u64,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address (host:port)
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Local directory mirrored against the server
    #[serde(default = "default_client_mount")]
    pub mount_path: PathBuf,

    /// Identifier presented when taking write locks
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// RPC deadline in milliseconds, applied to every call
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay before resubscribing to the catalog feed after it drops
    #[serde(default = "default_resubscribe_interval_ms")]
    pub resubscribe_interval_ms: u64,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Size of each data chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7640".to_string()
}

fn default_server_mount() -> PathBuf {
    PathBuf::from("/var/lib/wolfstore/mnt")
}

fn default_callback_interval_ms() -> u64 {
    5000
}

fn default_server_address() -> String {
    "127.0.0.1:7640".to_string()
}

fn default_client_mount() -> PathBuf {
    PathBuf::from("./wolfstore")
}

/// `user@host`; the same value on every run for a given user and host
fn default_client_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());

    match std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
        Ok(user) if !user.is_empty() => format!("{}@{}", user, host),
        _ => host,
    }
}

fn default_deadline_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_resubscribe_interval_ms() -> u64 {
    2000
}

/// Default chunk size (64 KiB)
pub fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            mount_path: default_server_mount(),
            callback_interval_ms: default_callback_interval_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            mount_path: default_client_mount(),
            client_id: default_client_id(),
            deadline_ms: default_deadline_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            resubscribe_interval_ms: default_resubscribe_interval_ms(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for WolfStoreConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl WolfStoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render a starter configuration file
    pub fn default_toml() -> crate::Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.bind_address.is_empty() {
            return Err(crate::Error::Config("server.bind_address cannot be empty".into()));
        }

        if self.client.server_address.is_empty() {
            return Err(crate::Error::Config("client.server_address cannot be empty".into()));
        }

        if self.client.client_id.is_empty() {
            return Err(crate::Error::Config("client.client_id cannot be empty".into()));
        }

        if self.client.deadline_ms == 0 {
            return Err(crate::Error::Config("client.deadline_ms must be greater than 0".into()));
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_FRAME_SIZE / 2 {
            return Err(crate::Error::Config(format!(
                "transfer.chunk_size must be between 1 and {} bytes",
                MAX_FRAME_SIZE / 2
            )));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => Ok(()),
            other => Err(crate::Error::Config(format!(
                "logging.format '{}' is not supported (use pretty or compact)",
                other
            ))),
        }
    }

    /// Get the RPC deadline as Duration
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.client.deadline_ms)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.client.connect_timeout_ms)
    }

    /// Get the resubscribe interval as Duration
    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_millis(self.client.resubscribe_interval_ms)
    }

    /// Get the snapshot interval, `None` when only changes trigger snapshots
    pub fn callback_interval(&self) -> Option<Duration> {
        match self.server.callback_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
