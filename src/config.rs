//! Client configuration.
//!
//! Loaded from TOML; every field has a default so a partial (or missing) file
//! is fine. Timings are stored in milliseconds.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TCP port the media server listens on
pub const DEFAULT_SERVER_PORT: u16 = 8888;

/// UDP port the media server answers discovery queries on
pub const DEFAULT_DISCOVERY_PORT: u16 = 8899;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name announced to the server in SYNC_START
    pub device_name: String,
    pub server_port: u16,
    /// Sync ledger file (defaults to the cache directory)
    pub ledger_path: Option<PathBuf>,
    pub connection: ConnectionConfig,
    pub transfer: TransferConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            server_port: DEFAULT_SERVER_PORT,
            ledger_path: None,
            connection: ConnectionConfig::default(),
            transfer: TransferConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "mediasync".to_string())
}

impl ClientConfig {
    /// Default config file location (~/.config/mediasync/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mediasync").join("config.toml"))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ledger location: configured path, else the cache directory.
    pub fn ledger_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.ledger_path {
            return Ok(path.clone());
        }
        dirs::cache_dir()
            .map(|d| d.join("mediasync").join("ledger.lst"))
            .ok_or_else(|| SyncError::Config("Cannot determine cache directory".to_string()))
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Outbound queue bound; producers block when it is full
    pub queue_capacity: usize,
    /// Chunks written per drain batch
    pub drain_batch: usize,
    /// Pause after a batch that emptied the queue
    pub drain_pause_ms: u64,
    /// Pause after a full batch
    pub drain_pause_full_ms: u64,
    /// Poll interval while blocked on a full queue
    pub backpressure_poll_ms: u64,
    pub keepalive_secs: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_cooldown_ms: u64,
    pub force_reconnect_cooldown_ms: u64,
    /// Inbound broadcast channel depth (in read chunks)
    pub inbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            drain_batch: 3,
            drain_pause_ms: 100,
            drain_pause_full_ms: 150,
            backpressure_poll_ms: 100,
            keepalive_secs: 10,
            connect_timeout_ms: 5_000,
            reconnect_cooldown_ms: 500,
            force_reconnect_cooldown_ms: 1_000,
            inbound_capacity: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn drain_pause(&self) -> Duration {
        Duration::from_millis(self.drain_pause_ms)
    }

    pub fn drain_pause_full(&self) -> Duration {
        Duration::from_millis(self.drain_pause_full_ms)
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn force_reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.force_reconnect_cooldown_ms)
    }
}

// =============================================================================
// Transfer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub base_timeout_ms: u64,
    /// Extra timeout allowance per MB of payload
    pub timeout_per_mb_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Frames above this size are written in pieces
    pub split_threshold: usize,
    pub piece_size: usize,
    pub piece_pause_ms: u64,
    /// Cancellation / closed-connection poll interval during waits
    pub poll_interval_ms: u64,
    /// Videos above this size use the chunked upload path
    pub chunked_threshold: u64,
    pub initial_chunk_size: usize,
    pub chunk_step: usize,
    pub target_rtt_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 10_000,
            timeout_per_mb_ms: 1_500,
            min_timeout_ms: 10_000,
            max_timeout_ms: 60_000,
            split_threshold: 5 * 1024 * 1024,
            piece_size: 1024 * 1024,
            piece_pause_ms: 50,
            poll_interval_ms: 100,
            chunked_threshold: 10 * 1024 * 1024,
            initial_chunk_size: 1024,
            chunk_step: 512,
            target_rtt_ms: 100,
        }
    }
}

impl TransferConfig {
    /// Never zero: it drives `tokio::time::interval`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn piece_pause(&self) -> Duration {
        Duration::from_millis(self.piece_pause_ms)
    }

    pub fn target_rtt(&self) -> Duration {
        Duration::from_millis(self.target_rtt_ms)
    }
}

// =============================================================================
// Discovery
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    /// How long to listen for replies
    pub window_ms: u64,
    pub subnet_mask: Ipv4Addr,
    /// Local address to derive the broadcast address from (auto-detected if unset)
    pub local_ip: Option<Ipv4Addr>,
    /// Send the query here instead of the computed broadcast address
    pub target_override: Option<Ipv4Addr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            window_ms: 5_000,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            local_ip: None,
            target_override: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.queue_capacity, 10);
        assert_eq!(config.connection.drain_batch, 3);
        assert_eq!(config.transfer.initial_chunk_size, 1024);
        assert_eq!(config.transfer.chunk_step, 512);
        assert_eq!(config.transfer.target_rtt(), Duration::from_millis(100));
        assert_eq!(config.discovery.window(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            device_name = "pixel-7"

            [transfer]
            target_rtt_ms = 250

            [discovery]
            subnet_mask = "255.255.0.0"
            "#,
        )
        .unwrap();

        assert_eq!(config.device_name, "pixel-7");
        assert_eq!(config.transfer.target_rtt_ms, 250);
        assert_eq!(config.transfer.chunk_step, 512);
        assert_eq!(config.discovery.subnet_mask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut config = ClientConfig::default();
        config.device_name = "tablet".to_string();
        config.connection.queue_capacity = 4;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.device_name, "tablet");
        assert_eq!(loaded.connection.queue_capacity, 4);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "server_port = \"not a number\"").unwrap();
        assert!(matches!(ClientConfig::load(&path), Err(SyncError::Config(_))));
    }
}
