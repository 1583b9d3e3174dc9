use crate::{LogIndex, NodeId, Term};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not the leader{}", leader_hint.map(|n| format!(", current leader is {n}")).unwrap_or_default())]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("no known leader")]
    NoLeader,

    #[error("quorum unavailable: {reason}")]
    QuorumUnavailable { reason: String },

    #[error("replication failed: {reason}")]
    ReplicationFailed { reason: String },

    #[error("durability failure: {reason}")]
    Durability { reason: String },

    #[error("stale term {got}, current term is {current}")]
    StaleTerm { got: Term, current: Term },

    #[error("snapshot failure: {reason}")]
    Snapshot { reason: String },

    #[error("blob integrity failure for {blob_id}: computed {computed}")]
    BlobIntegrity { blob_id: String, computed: String },

    #[error("blob durability quorum not reached: {acks} of {needed} acks")]
    BlobQuorum { acks: usize, needed: usize },

    #[error("invalid blob id {0:?}")]
    InvalidBlobId(String),

    #[error("blob {0} not found on any live peer")]
    BlobUnavailable(String),

    #[error("read barrier not established within {timeout_ms}ms")]
    BarrierTimeout { timeout_ms: u64 },

    #[error("corrupt log entry at index {index}: {reason}")]
    CorruptLogEntry { index: LogIndex, reason: String },

    #[error("proposal queue closed")]
    ProposerClosed,

    #[error("value of {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: u64, max: u64 },

    #[error("no such namespace {0:?}")]
    NamespaceNotFound(String),

    #[error("no such key {key:?} in namespace {namespace:?}")]
    KeyNotFound { namespace: String, key: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: NodeId, reason: String },

    #[error("unauthorized internal request")]
    Unauthorized,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures that the RPC layer may retry against the same peer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::NoLeader)
    }
}
