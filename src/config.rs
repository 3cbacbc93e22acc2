//! Node configuration
//!
//! Every section falls back to the values in [`defaults`], so a TOML file only
//! needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::membership::types::NodeId;

/// Default configuration constants
pub mod defaults {
    /// Coherency transaction deadline (read/write/invalidate).
    pub const TRANSACTION_TIMEOUT_MS: u64 = 5_000;

    /// Attempts of a line operation that keeps losing to concurrent
    /// initiators on other nodes.
    pub const CONTENTION_RETRIES: u32 = 8;

    /// Overall deadline of a kernel execution task.
    pub const TASK_TIMEOUT_MS: u64 = 30_000;

    /// Deadline for pulling a kernel definition from a peer.
    pub const FETCH_TIMEOUT_MS: u64 = 5_000;

    /// Finished tasks kept for lookup before the oldest are pruned.
    pub const MAX_FINISHED_TASKS: usize = 1_024;

    pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
    pub const DISCOVERY_INTERVAL_MS: u64 = 30_000;
    pub const NODE_TIMEOUT_MS: u64 = 30_000;

    /// Wait for a transport-level delivery receipt before resending.
    pub const ACK_TIMEOUT_MS: u64 = 500;
    pub const SEND_ATTEMPTS: usize = 3;
    /// Largest UDP payload over IPv4.
    pub const MAX_DATAGRAM_BYTES: usize = 65_507;
    /// Number of (source, type, sequence) triples remembered for dedup.
    pub const DEDUP_WINDOW: usize = 10_000;

    pub const HTTP_PORT_OFFSET: u16 = 1000;

    pub const fn default_bind() -> &'static str {
        "127.0.0.1:7400"
    }

    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KosConfig {
    pub node: NodeConfig,
    pub coherency: CoherencyConfig,
    pub dispatcher: DispatcherConfig,
    pub membership: MembershipConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: Option<String>,
    pub bind: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub http_port_offset: u16,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind: defaults::default_bind()
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7400))),
            seeds: Vec::new(),
            http_port_offset: defaults::HTTP_PORT_OFFSET,
            log_level: defaults::default_log_level().to_string(),
        }
    }
}

impl NodeConfig {
    pub fn resolved_node_id(&self) -> NodeId {
        match &self.node_id {
            Some(id) => NodeId(id.clone()),
            None => NodeId::new(),
        }
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.bind.ip(),
            self.bind.port().saturating_add(self.http_port_offset),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherencyConfig {
    pub transaction_timeout_ms: u64,
    /// Per-node line capacity; `None` means unbounded.
    pub max_lines_per_node: Option<usize>,
    /// Node that owns the backing store. Writebacks are shipped to it when
    /// it is not hosted by the local engine.
    pub home_node: Option<String>,
    pub contention_retries: u32,
}

impl Default for CoherencyConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: defaults::TRANSACTION_TIMEOUT_MS,
            max_lines_per_node: None,
            home_node: None,
            contention_retries: defaults::CONTENTION_RETRIES,
        }
    }
}

impl CoherencyConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub task_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub max_finished_tasks: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: defaults::TASK_TIMEOUT_MS,
            fetch_timeout_ms: defaults::FETCH_TIMEOUT_MS,
            max_finished_tasks: defaults::MAX_FINISHED_TASKS,
        }
    }
}

impl DispatcherConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub heartbeat_interval_ms: u64,
    pub discovery_interval_ms: u64,
    pub node_timeout_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            discovery_interval_ms: defaults::DISCOVERY_INTERVAL_MS,
            node_timeout_ms: defaults::NODE_TIMEOUT_MS,
        }
    }
}

impl MembershipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ack_timeout_ms: u64,
    pub send_attempts: usize,
    pub max_datagram_bytes: usize,
    pub dedup_window: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: defaults::ACK_TIMEOUT_MS,
            send_attempts: defaults::SEND_ATTEMPTS,
            max_datagram_bytes: defaults::MAX_DATAGRAM_BYTES,
            dedup_window: defaults::DEDUP_WINDOW,
        }
    }
}

impl KosConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: KosConfig = toml::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_timeouts() {
        let config = KosConfig::default();
        assert_eq!(config.coherency.transaction_timeout(), Duration::from_secs(5));
        assert_eq!(config.dispatcher.task_timeout(), Duration::from_secs(30));
        assert_eq!(config.membership.heartbeat_interval_ms, 10_000);
        assert_eq!(config.membership.discovery_interval_ms, 30_000);
        assert_eq!(config.membership.node_timeout_ms, 30_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = KosConfig::from_toml(
            r#"
            [node]
            node_id = "node-a"
            bind = "10.0.0.1:9000"

            [coherency]
            max_lines_per_node = 128
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.node.resolved_node_id(), NodeId::from("node-a"));
        assert_eq!(config.node.http_addr().port(), 10_000);
        assert_eq!(config.coherency.max_lines_per_node, Some(128));
        assert_eq!(config.coherency.transaction_timeout_ms, 5_000);
        assert_eq!(config.transport.send_attempts, 3);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(KosConfig::from_toml("[node\nbind = 3").is_err());
    }
}
