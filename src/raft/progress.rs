use crate::{LogIndex, NodeId};
use std::collections::HashMap;
use std::time::Instant;

/// Leader-side replication state for one follower.
#[derive(Debug)]
pub struct Progress {
    /// Next log index to send.
    pub next_index: LogIndex,
    /// Highest index known durably replicated on the follower.
    pub match_index: LogIndex,
    /// One outstanding RPC per follower; further sends wait for the result.
    pub inflight: bool,
    /// Sequence number of the last request this follower acknowledged.
    pub acked_seq: u64,
    pub last_ack: Option<Instant>,
}

impl Progress {
    fn new(last_index: LogIndex) -> Progress {
        Progress {
            next_index: last_index + 1,
            match_index: 0,
            inflight: false,
            acked_seq: 0,
            last_ack: None,
        }
    }
}

/// All followers' progress, reinitialized on every election win.
#[derive(Debug)]
pub struct ProgressSet {
    followers: HashMap<NodeId, Progress>,
}

impl ProgressSet {
    pub fn new(peers: &[NodeId], last_index: LogIndex) -> ProgressSet {
        ProgressSet {
            followers: peers.iter().map(|p| (*p, Progress::new(last_index))).collect(),
        }
    }

    pub fn get_mut(&mut self, peer: NodeId) -> Option<&mut Progress> {
        self.followers.get_mut(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.followers.keys().copied()
    }

    /// Highest `N` such that a majority of the cluster (followers plus the
    /// leader itself) has durably stored the log through `N`.
    pub fn quorum_match(&self, leader_durable: LogIndex, majority: usize) -> LogIndex {
        let mut matches: Vec<LogIndex> = self
            .followers
            .values()
            .map(|p| p.match_index)
            .chain(std::iter::once(leader_durable))
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        matches.get(majority - 1).copied().unwrap_or(0)
    }

    /// Followers heard from (successfully) since `cutoff`, plus the leader.
    pub fn reachable_since(&self, cutoff: Instant) -> usize {
        1 + self
            .followers
            .values()
            .filter(|p| p.last_ack.map_or(false, |t| t >= cutoff))
            .count()
    }

    /// Number of followers whose latest ack covers `seq`, plus the leader.
    pub fn acks_at_or_after(&self, seq: u64) -> usize {
        1 + self
            .followers
            .values()
            .filter(|p| p.acked_seq >= seq)
            .count()
    }
}
