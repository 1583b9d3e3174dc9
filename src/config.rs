use crate::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Behavior of a read when the barrier cannot be established in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierFailureMode {
    /// Reject with a 503-class error and a retry hint.
    Reject,
    /// Serve possibly-stale data and log a warning.
    Stale,
    /// Report a gateway-timeout-class error.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBarrierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_barrier_mode")]
    pub failure_mode: BarrierFailureMode,
    #[serde(default = "default_barrier_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ReadBarrierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_mode: BarrierFailureMode::Reject,
            timeout_ms: default_barrier_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Values at or above this size leave the log and go through the blob
    /// side-channel; smaller values stay inline in the log entry.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: u64,
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size_bytes: u64,
    /// Shared secret for the internal blob and consensus endpoints.
    #[serde(default)]
    pub cluster_token: String,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// Orphaned blobs younger than this survive a sweep.
    #[serde(default = "default_gc_grace_secs")]
    pub gc_grace_secs: u64,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inline_threshold_bytes: default_inline_threshold(),
            max_blob_size_bytes: default_max_blob_size(),
            cluster_token: String::new(),
            gc_interval_secs: default_gc_interval_secs(),
            gc_grace_secs: default_gc_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Ordered list of cluster member addresses, identical on every node.
    /// A node's identity is its position in this list.
    pub members: Vec<String>,
    /// This node's position in `members`.
    pub node_id: u64,
    /// Root of the per-node data directory.
    pub data_path: PathBuf,

    #[serde(default = "default_election_lower_ms")]
    pub election_timeout_lower_ms: u64,
    #[serde(default = "default_election_upper_ms")]
    pub election_timeout_upper_ms: u64,
    /// Heartbeats go out at this fraction of the lower election timeout.
    #[serde(default = "default_heartbeat_threshold")]
    pub heartbeat_threshold: f64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Applied commands between snapshots. A batch of N counts as N.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_max_bytes")]
    pub flush_max_bytes: u64,
    #[serde(default = "default_wal_chunk_max_bytes")]
    pub wal_chunk_max_bytes: u64,

    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: u64,
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,

    #[serde(default)]
    pub read_barrier: ReadBarrierConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
}

fn default_true() -> bool {
    true
}
fn default_barrier_mode() -> BarrierFailureMode {
    BarrierFailureMode::Reject
}
fn default_barrier_timeout_ms() -> u64 {
    5_000
}
fn default_inline_threshold() -> u64 {
    64 * 1024
}
fn default_max_blob_size() -> u64 {
    256 * 1024 * 1024
}
fn default_gc_interval_secs() -> u64 {
    300
}
fn default_gc_grace_secs() -> u64 {
    600
}
fn default_election_lower_ms() -> u64 {
    1_000
}
fn default_election_upper_ms() -> u64 {
    3_000
}
fn default_heartbeat_threshold() -> f64 {
    0.5
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_snapshot_interval() -> u64 {
    1_000
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_flush_max_bytes() -> u64 {
    4 * 1024 * 1024
}
fn default_wal_chunk_max_bytes() -> u64 {
    8 * 1024 * 1024
}
fn default_batch_max_size() -> usize {
    50
}
fn default_batch_max_bytes() -> u64 {
    1024 * 1024
}
fn default_batch_max_wait_ms() -> u64 {
    1
}

impl NodeConfig {
    /// Load from a JSON file, then apply `CONFMAN_NODE_ID` and
    /// `CONFMAN_DATA_PATH` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        if let Ok(id) = std::env::var("CONFMAN_NODE_ID") {
            config.node_id = id
                .parse()
                .map_err(|_| Error::Config(format!("CONFMAN_NODE_ID={id} is not a number")))?;
        }
        if let Ok(data) = std::env::var("CONFMAN_DATA_PATH") {
            config.data_path = PathBuf::from(data);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::Config("members must not be empty".into()));
        }
        if self.node_id as usize >= self.members.len() {
            return Err(Error::Config(format!(
                "node_id {} out of range for {} members",
                self.node_id,
                self.members.len()
            )));
        }
        if self.election_timeout_lower_ms >= self.election_timeout_upper_ms {
            return Err(Error::Config(
                "election_timeout_lower_ms must be below election_timeout_upper_ms".into(),
            ));
        }
        if !(self.heartbeat_threshold > 0.0 && self.heartbeat_threshold < 1.0) {
            return Err(Error::Config(
                "heartbeat_threshold must be within (0, 1)".into(),
            ));
        }
        // Liveness invariant: a node must be able to complete an RPC round
        // before its peers give up on it.
        if self.request_timeout_ms <= self.election_timeout_lower_ms {
            return Err(Error::Config(
                "request_timeout_ms must exceed election_timeout_lower_ms".into(),
            ));
        }
        if self.batch_max_size == 0 {
            return Err(Error::Config("batch_max_size must be at least 1".into()));
        }
        if self.blob_store.enabled && self.blob_store.inline_threshold_bytes == 0 {
            return Err(Error::Config(
                "inline_threshold_bytes must be positive when the blob store is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        (0..self.members.len() as u64)
            .map(NodeId)
            .filter(|n| *n != self.id())
            .collect()
    }

    pub fn member_addr(&self, node: NodeId) -> Option<&str> {
        self.members.get(node.0 as usize).map(String::as_str)
    }

    /// Majority size, counting this node: `⌈(N+1)/2⌉`.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_lower_ms),
            Duration::from_millis(self.election_timeout_upper_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let ms = (self.election_timeout_lower_ms as f64 * self.heartbeat_threshold) as u64;
        Duration::from_millis(ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.read_barrier.timeout_ms)
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_path.join("raft-log")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_path.join("snapshots")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_path.join("blobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NodeConfig {
        serde_json::from_str(
            r#"{
                "members": ["127.0.0.1:7101", "127.0.0.1:7102", "127.0.0.1:7103"],
                "node_id": 0,
                "data_path": "/tmp/confman-test"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = base();
        assert_eq!(config.election_timeout_lower_ms, 1_000);
        assert_eq!(config.election_timeout_upper_ms, 3_000);
        assert_eq!(config.snapshot_interval, 1_000);
        assert_eq!(config.blob_store.inline_threshold_bytes, 64 * 1024);
        assert_eq!(config.batch_max_size, 50);
        config.validate().unwrap();
    }

    #[test]
    fn majority_of_three_is_two() {
        assert_eq!(base().majority(), 2);
    }

    #[test]
    fn rejects_inverted_election_range() {
        let mut config = base();
        config.election_timeout_lower_ms = 3_000;
        config.election_timeout_upper_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_request_timeout_below_election_lower() {
        let mut config = base();
        config.request_timeout_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_node_id() {
        let mut config = base();
        config.node_id = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn peers_excludes_self() {
        let config = base();
        assert_eq!(config.peers(), vec![NodeId(1), NodeId(2)]);
    }
}
