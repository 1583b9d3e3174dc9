#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Confman: a distributed, strongly-consistent configuration store.
//!
//! A leader-driven replicated log orders all mutations, a deterministic
//! applier folds committed entries into the materialized store, and reads
//! pass through a quorum-confirmed barrier before they are served. Large
//! values travel out-of-band through a content-addressed blob store so the
//! log itself stays small.

pub mod applier;
pub mod barrier;
pub mod blob;
pub mod command;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod proposer;
pub mod raft;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod wal;
pub mod wire;

pub mod test_utils;

pub use error::{Error, Result};

/// Logical clock epoch. At most one leader exists per term.
pub type Term = u64;

/// Position of an entry in the replicated log. `(Term, LogIndex)` uniquely
/// identifies an entry cluster-wide once committed.
pub type LogIndex = u64;

/// A member's position in the statically configured `members` list. The
/// list is identical on every node, so the index is stable cluster-wide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}
