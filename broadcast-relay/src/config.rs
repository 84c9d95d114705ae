use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::message::{DEFAULT_BROADCAST_PREFIX, Formatter, prefix_formatter};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// What to do with a recipient whose outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Drop the frame for that recipient only; it stays connected.
    #[default]
    Drop,
    /// Evict the recipient; its transport closes after flushing what is queued.
    Disconnect,
}

/// Relay settings. Every field has a default, so a config file only needs
/// the keys it wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub outbound_queue_capacity: usize,
    pub exclude_originator: bool,
    pub slow_consumer: SlowConsumerPolicy,
    pub broadcast_prefix: String,
    /// Seconds between stats log lines; 0 disables them.
    pub stats_interval_secs: u64,
    /// Seconds a new socket gets to complete the WebSocket upgrade.
    pub handshake_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            exclude_originator: false,
            slow_consumer: SlowConsumerPolicy::Drop,
            broadcast_prefix: DEFAULT_BROADCAST_PREFIX.to_string(),
            stats_interval_secs: 0,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

impl RelayConfig {
    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_connections > 0, "max_connections must be at least 1");
        ensure!(
            self.outbound_queue_capacity > 0,
            "outbound_queue_capacity must be at least 1"
        );
        ensure!(
            self.handshake_timeout_secs > 0,
            "handshake_timeout_secs must be at least 1"
        );
        Ok(())
    }

    pub fn formatter(&self) -> Formatter {
        prefix_formatter(self.broadcast_prefix.clone())
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
