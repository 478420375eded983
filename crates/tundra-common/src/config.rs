//! Driver configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Network address for a replica or shard endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid address"))
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What to do when a streaming operation outlives its execution deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Fail the query with a timeout error
    #[default]
    Throw,
    /// Stop the stream quietly and return what was produced so far
    Break,
}

/// Query driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Race slow replicas against backups instead of plain multiplexing
    pub use_hedged_requests: bool,

    /// An empty connection set ends the query instead of failing it
    pub skip_unavailable_shards: bool,

    /// Push scalar subquery results to replicas after the query packet
    pub enable_scalar_subquery_optimization: bool,

    /// Deadline for feeding external tables, 0 = unlimited
    pub max_execution_time_ms: u64,

    /// Behavior when the external-table deadline is exceeded
    pub timeout_overflow_mode: OverflowMode,

    /// Connect timeout per replica
    pub connect_timeout_ms: u64,

    /// Send timeout per outbound packet
    pub send_timeout_ms: u64,

    /// How long a receive may go without any replica producing a packet
    pub receive_timeout_ms: u64,

    /// How long a hedged primary may stall before a backup is promoted
    pub hedged_failover_timeout_ms: u64,

    /// Deadline for draining a finished or cancelled conversation
    pub drain_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_hedged_requests: false,
            skip_unavailable_shards: false,
            enable_scalar_subquery_optimization: true,
            max_execution_time_ms: 0,
            timeout_overflow_mode: OverflowMode::Throw,
            connect_timeout_ms: 1_000,
            send_timeout_ms: 30_000,
            receive_timeout_ms: 300_000,
            hedged_failover_timeout_ms: 100,
            drain_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self, crate::TundraError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::TundraError::Config(e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), crate::TundraError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Timeout bundle handed to connections at query start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl ConnectionTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect: Duration::from_millis(settings.connect_timeout_ms),
            send: Duration::from_millis(settings.send_timeout_ms),
            receive: Duration::from_millis(settings.receive_timeout_ms),
        }
    }
}
