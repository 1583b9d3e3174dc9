pub mod message;
pub mod progress;

use crate::applier::SnapshotInstall;
use crate::config::NodeConfig;
use crate::snapshot;
use crate::transport::Transport;
use crate::wal::{HardState, Wal};
use crate::wire::{EntryKind, LogEntry};
use crate::{Error, LogIndex, NodeId, Result, Term};
use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use progress::ProgressSet;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// How many payload bytes one AppendEntries call may carry.
const REPLICATION_BATCH_BYTES: u64 = 1024 * 1024;

/// Driver wake-up granularity for timers.
const TICK_INTERVAL: Duration = Duration::from_millis(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of the consensus engine, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_index: LogIndex,
}

pub enum RaftEvent {
    RequestVote {
        req: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        reply: oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
    /// A client proposal from the batching proposer. Resolved when the
    /// entry commits (or is known lost).
    Propose {
        kind: EntryKind,
        payload: Vec<u8>,
        commit: oneshot::Sender<Result<(Term, LogIndex)>>,
    },
    /// Leader-side read barrier: confirm leadership with a quorum round,
    /// then hand back the commit index recorded at arrival.
    ReadIndex {
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    VoteResult {
        from: NodeId,
        term: Term,
        result: Result<RequestVoteResponse>,
    },
    AppendResult {
        peer: NodeId,
        seq: u64,
        sent_to: LogIndex,
        result: Result<AppendEntriesResponse>,
    },
    SnapshotResult {
        peer: NodeId,
        seq: u64,
        snapshot_index: LogIndex,
        result: Result<InstallSnapshotResponse>,
    },
    /// The local group commit advanced; re-evaluate the commit index.
    LocalDurable,
}

struct CommitWaiter {
    index: LogIndex,
    term: Term,
    tx: oneshot::Sender<Result<(Term, LogIndex)>>,
}

struct PendingRead {
    round_seq: u64,
    read_index: LogIndex,
    started: Instant,
    tx: oneshot::Sender<Result<LogIndex>>,
}

enum Role {
    Follower,
    Candidate { votes: HashSet<NodeId> },
    Leader(LeaderState),
}

struct LeaderState {
    progress: ProgressSet,
    seq: u64,
    since: Instant,
    pending_reads: Vec<PendingRead>,
    next_heartbeat: Instant,
}

/// Cheap-to-clone handle onto the consensus driver. All interaction runs
/// through the driver's event queue; there is no shared mutable state.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<RaftEvent>,
    status_rx: watch::Receiver<RaftStatus>,
    commit_rx: watch::Receiver<LogIndex>,
}

impl std::fmt::Debug for RaftHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftHandle").finish()
    }
}

impl RaftHandle {
    fn send(&self, event: RaftEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| Error::QuorumUnavailable {
            reason: "consensus engine has shut down".into(),
        })
    }

    pub async fn propose(&self, kind: EntryKind, payload: Vec<u8>) -> Result<(Term, LogIndex)> {
        let (commit, rx) = oneshot::channel();
        self.send(RaftEvent::Propose {
            kind,
            payload,
            commit,
        })?;
        rx.await.map_err(|_| Error::ReplicationFailed {
            reason: "consensus engine dropped the proposal".into(),
        })?
    }

    pub async fn read_index(&self) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::ReadIndex { reply })?;
        rx.await.map_err(|_| Error::QuorumUnavailable {
            reason: "leadership changed during the confirmation round".into(),
        })?
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::RequestVote { req, reply })?;
        rx.await.map_err(|_| Error::QuorumUnavailable {
            reason: "consensus engine has shut down".into(),
        })
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::AppendEntries { req, reply })?;
        rx.await.map_err(|_| Error::QuorumUnavailable {
            reason: "consensus engine has shut down".into(),
        })
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::InstallSnapshot { req, reply })?;
        rx.await.map_err(|_| Error::QuorumUnavailable {
            reason: "consensus engine has shut down".into(),
        })?
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    pub fn commit_watch(&self) -> watch::Receiver<LogIndex> {
        self.commit_rx.clone()
    }
}

pub struct RaftNode {
    id: NodeId,
    config: Arc<NodeConfig>,
    wal: Arc<Wal>,
    transport: Arc<dyn Transport>,
    snapshots_dir: PathBuf,
    install_tx: mpsc::Sender<SnapshotInstall>,

    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    leader_hint: Option<NodeId>,
    commit_index: LogIndex,
    election_deadline: Instant,

    commit_waiters: Vec<CommitWaiter>,

    event_tx: mpsc::UnboundedSender<RaftEvent>,
    status_tx: watch::Sender<RaftStatus>,
    commit_tx: watch::Sender<LogIndex>,
}

impl RaftNode {
    /// Start the consensus driver task and return its handle.
    pub fn spawn(
        config: Arc<NodeConfig>,
        wal: Arc<Wal>,
        transport: Arc<dyn Transport>,
        install_tx: mpsc::Sender<SnapshotInstall>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RaftHandle {
        let id = config.id();
        let hard_state = wal.hard_state();
        let commit_index = hard_state.commit_index.max(wal.base_index());
        let status = RaftStatus {
            id,
            role: RoleKind::Follower,
            term: hard_state.term,
            leader: None,
            commit_index,
            last_index: wal.last_index(),
        };
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(status);
        let (commit_tx, commit_rx) = watch::channel(commit_index);

        let mut node = RaftNode {
            id,
            snapshots_dir: config.snapshots_dir(),
            config,
            wal,
            transport,
            install_tx,
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader_hint: None,
            commit_index,
            election_deadline: Instant::now(),
            commit_waiters: Vec::new(),
            event_tx: event_tx.clone(),
            status_tx,
            commit_tx,
        };
        node.reset_election_deadline();

        let handle = RaftHandle {
            tx: event_tx,
            status_rx,
            commit_rx,
        };

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => node.on_tick(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = event_rx.recv() => match event {
                        Some(event) => node.on_event(event).await,
                        None => break,
                    },
                }
            }
            debug!(node = %node.id, "consensus driver stopped");
        });
        handle
    }

    fn reset_election_deadline(&mut self) {
        let (lower, upper) = self.config.election_timeout_range();
        let timeout = rand::thread_rng().gen_range(lower..=upper);
        self.election_deadline = Instant::now() + timeout;
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        self.wal.save_hard_state(&HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        })
    }

    fn publish_status(&self) {
        let role = match self.role {
            Role::Follower => RoleKind::Follower,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        };
        let _ = self.status_tx.send(RaftStatus {
            id: self.id,
            role,
            term: self.term,
            leader: self.leader_hint,
            commit_index: self.commit_index,
            last_index: self.wal.last_index(),
        });
    }

    fn set_commit_index(&mut self, commit: LogIndex) {
        if commit <= self.commit_index {
            return;
        }
        self.commit_index = commit;
        let _ = self.commit_tx.send(commit);
        if let Err(e) = self.persist_hard_state() {
            warn!(error = %e, "failed to persist commit index");
        }
        self.publish_status();
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        match &mut self.role {
            Role::Follower | Role::Candidate { .. } => {
                if now >= self.election_deadline {
                    self.start_election();
                }
            }
            Role::Leader(leader) => {
                let grace = now
                    .checked_sub(self.config.request_timeout())
                    .unwrap_or(now);
                // Step down when a majority has been unreachable for a
                // full request timeout; the node turns read-only.
                let quorum_lost = leader.since <= grace
                    && leader.progress.reachable_since(grace) < self.config.majority();
                let heartbeat_due = now >= leader.next_heartbeat;
                if heartbeat_due {
                    leader.next_heartbeat = now + self.config.heartbeat_interval();
                }
                if quorum_lost {
                    warn!(term = self.term, "lost contact with quorum, stepping down");
                    self.step_down(self.term, None);
                    return;
                }
                if heartbeat_due {
                    self.broadcast_append();
                }
                self.expire_pending_reads();
            }
        }
    }

    async fn on_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::RequestVote { req, reply } => {
                let resp = self.on_request_vote(req);
                let _ = reply.send(resp);
            }
            RaftEvent::AppendEntries { req, reply } => {
                self.on_append_entries(req, reply).await;
            }
            RaftEvent::InstallSnapshot { req, reply } => {
                let resp = self.on_install_snapshot(req).await;
                let _ = reply.send(resp);
            }
            RaftEvent::Propose {
                kind,
                payload,
                commit,
            } => self.on_propose(kind, payload, commit),
            RaftEvent::ReadIndex { reply } => self.on_read_index(reply),
            RaftEvent::VoteResult { from, term, result } => self.on_vote_result(from, term, result),
            RaftEvent::AppendResult {
                peer,
                seq,
                sent_to,
                result,
            } => self.on_append_result(peer, seq, sent_to, result),
            RaftEvent::SnapshotResult {
                peer,
                seq,
                snapshot_index,
                result,
            } => self.on_snapshot_result(peer, seq, snapshot_index, result),
            RaftEvent::LocalDurable => {
                if matches!(self.role, Role::Leader(_)) {
                    self.advance_commit();
                    self.complete_pending_reads();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Elections

    fn start_election(&mut self) {
        self.term += 1;
        self.voted_for = Some(self.id);
        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate { votes };
        self.leader_hint = None;
        self.reset_election_deadline();
        if let Err(e) = self.persist_hard_state() {
            warn!(error = %e, "could not persist vote for self, abandoning election");
            self.role = Role::Follower;
            return;
        }
        info!(term = self.term, "election timeout elapsed, soliciting votes");
        self.publish_status();

        if self.config.majority() == 1 {
            self.become_leader();
            return;
        }
        let req = RequestVoteRequest {
            term: self.term,
            candidate: self.id,
            last_log_index: self.wal.last_index(),
            last_log_term: self.wal.last_term(),
        };
        for peer in self.config.peers() {
            let transport = Arc::clone(&self.transport);
            let tx = self.event_tx.clone();
            let req = req.clone();
            let term = self.term;
            tokio::spawn(async move {
                let result = transport.request_vote(peer, req).await;
                let _ = tx.send(RaftEvent::VoteResult {
                    from: peer,
                    term,
                    result,
                });
            });
        }
    }

    fn on_vote_result(&mut self, from: NodeId, term: Term, result: Result<RequestVoteResponse>) {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                debug!(peer = %from, error = %e, "vote request failed");
                return;
            }
        };
        if resp.term > self.term {
            self.step_down(resp.term, None);
            return;
        }
        if term != self.term || !resp.granted {
            return;
        }
        let won = match &mut self.role {
            Role::Candidate { votes } => {
                votes.insert(from);
                votes.len() >= self.config.majority()
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        info!(term = self.term, "won election, becoming leader");
        let progress = ProgressSet::new(&self.config.peers(), self.wal.last_index());
        self.role = Role::Leader(LeaderState {
            progress,
            seq: 0,
            since: Instant::now(),
            pending_reads: Vec::new(),
            next_heartbeat: Instant::now() + self.config.heartbeat_interval(),
        });
        self.leader_hint = Some(self.id);
        self.publish_status();
        // A no-op from the new term lets the commit index advance over
        // entries inherited from earlier terms.
        let noop = LogEntry::noop(self.wal.last_index() + 1, self.term);
        self.append_local(vec![noop]);
        self.broadcast_append();
    }

    fn step_down(&mut self, term: Term, leader: Option<NodeId>) {
        let was_leader = matches!(self.role, Role::Leader(_));
        if was_leader || term > self.term {
            info!(
                old_term = self.term,
                new_term = term,
                "reverting to follower"
            );
        }
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.leader_hint = leader;
        self.reset_election_deadline();
        if let Err(e) = self.persist_hard_state() {
            warn!(error = %e, "failed to persist state while stepping down");
        }
        if was_leader {
            // Callers see these as failed; a later leader may still
            // commit them, but this node can no longer vouch.
            for waiter in self.commit_waiters.drain(..) {
                let _ = waiter.tx.send(Err(Error::ReplicationFailed {
                    reason: "leadership lost before commit".into(),
                }));
            }
        }
        self.publish_status();
    }

    fn on_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        if req.term < self.term {
            return RequestVoteResponse {
                term: self.term,
                granted: false,
            };
        }
        if req.term > self.term {
            self.step_down(req.term, None);
        }
        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (self.wal.last_term(), self.wal.last_index());
        let granted = up_to_date && self.voted_for.map_or(true, |v| v == req.candidate);
        if granted {
            self.voted_for = Some(req.candidate);
            self.reset_election_deadline();
            // The vote must be durable before the candidate can count it.
            if let Err(e) = self.persist_hard_state() {
                warn!(error = %e, "failed to persist vote, denying");
                return RequestVoteResponse {
                    term: self.term,
                    granted: false,
                };
            }
            debug!(term = self.term, candidate = %req.candidate, "vote granted");
        }
        RequestVoteResponse {
            term: self.term,
            granted,
        }
    }

    // ------------------------------------------------------------------
    // Follower replication

    async fn on_append_entries(
        &mut self,
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    ) {
        if req.term < self.term {
            // StaleTerm: answer with our term and otherwise ignore.
            let _ = reply.send(AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: 0,
                conflict_hint: None,
            });
            return;
        }
        if req.term > self.term || !matches!(self.role, Role::Follower) {
            self.step_down(req.term, Some(req.leader));
        }
        if self.leader_hint != Some(req.leader) {
            self.leader_hint = Some(req.leader);
            self.publish_status();
        }
        self.reset_election_deadline();

        let base = self.wal.base_index();
        if req.prev_log_index > base
            && self.wal.entry_term(req.prev_log_index) != Some(req.prev_log_term)
        {
            let hint = (self.wal.last_index() + 1).min(req.prev_log_index);
            let _ = reply.send(AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: 0,
                conflict_hint: Some(hint),
            });
            return;
        }

        // Everything through prev (and anything the snapshot base covers)
        // is known to match; after this call the log holds through here:
        let ack_match = (req.prev_log_index + req.entries.len() as u64).max(base);

        // Drop entries the snapshot already covers, then find the first
        // conflicting or missing one. Past a conflict everything is
        // appended, because the conflicting suffix gets truncated.
        let mut to_append = Vec::new();
        let mut conflict_at = None;
        for entry in req.entries {
            if entry.index <= base {
                continue;
            }
            if conflict_at.is_some() {
                to_append.push(entry);
                continue;
            }
            match self.wal.entry_term(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    conflict_at = Some(entry.index);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if let Some(conflict) = conflict_at {
            if let Err(e) = self.wal.truncate_from(conflict).await {
                warn!(error = %e, "failed to truncate conflicting suffix");
                let _ = reply.send(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: 0,
                    conflict_hint: None,
                });
                return;
            }
        }

        // Commit follows the leader, capped at what this call verified.
        let new_commit = req.leader_commit.min(ack_match);

        if to_append.is_empty() {
            self.set_commit_index(new_commit);
            let _ = reply.send(AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index: ack_match,
                conflict_hint: None,
            });
            return;
        }

        match self.wal.append(to_append) {
            Ok(ack) => {
                // The entries are in the in-memory log now, so the
                // applier can follow the commit index immediately.
                self.set_commit_index(new_commit);
                let term = self.term;
                // The success answer waits for fsync so the leader only
                // counts durable replicas, but the driver moves on.
                tokio::spawn(async move {
                    let resp = match ack.wait().await {
                        Ok(()) => AppendEntriesResponse {
                            term,
                            success: true,
                            match_index: ack_match,
                            conflict_hint: None,
                        },
                        Err(_) => AppendEntriesResponse {
                            term,
                            success: false,
                            match_index: 0,
                            conflict_hint: None,
                        },
                    };
                    let _ = reply.send(resp);
                });
            }
            Err(e) => {
                warn!(error = %e, "append to local log failed");
                let _ = reply.send(AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: 0,
                    conflict_hint: None,
                });
            }
        }
    }

    async fn on_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if req.term < self.term {
            return Ok(InstallSnapshotResponse { term: self.term });
        }
        if req.term > self.term || !matches!(self.role, Role::Follower) {
            self.step_down(req.term, Some(req.leader));
        }
        self.leader_hint = Some(req.leader);
        self.reset_election_deadline();
        if req.snapshot_index <= self.wal.base_index() {
            return Ok(InstallSnapshotResponse { term: self.term });
        }
        info!(
            index = req.snapshot_index,
            term = req.snapshot_term,
            "installing snapshot from leader"
        );
        let file = snapshot::install_bytes(&self.snapshots_dir, &req.data)?;
        let (reply, rx) = oneshot::channel();
        self.install_tx
            .send(SnapshotInstall { file, reply })
            .await
            .map_err(|_| Error::Snapshot {
                reason: "applier is gone".into(),
            })?;
        rx.await.map_err(|_| Error::Snapshot {
            reason: "applier dropped the install request".into(),
        })??;
        self.wal
            .reset_to_snapshot(req.snapshot_index, req.snapshot_term)
            .await?;
        self.set_commit_index(req.snapshot_index);
        self.reset_election_deadline();
        Ok(InstallSnapshotResponse { term: self.term })
    }

    // ------------------------------------------------------------------
    // Leader replication

    fn on_propose(
        &mut self,
        kind: EntryKind,
        payload: Vec<u8>,
        commit: oneshot::Sender<Result<(Term, LogIndex)>>,
    ) {
        if !matches!(self.role, Role::Leader(_)) {
            let _ = commit.send(Err(Error::NotLeader {
                leader_hint: self.leader_hint,
            }));
            return;
        }
        let index = self.wal.last_index() + 1;
        let term = self.term;
        let entry = LogEntry {
            index,
            term,
            kind,
            payload,
        };
        self.commit_waiters.push(CommitWaiter {
            index,
            term,
            tx: commit,
        });
        self.append_local(vec![entry]);
        self.broadcast_append();
    }

    /// Append to the local log and poke the driver once the fsync lands.
    fn append_local(&mut self, entries: Vec<LogEntry>) {
        match self.wal.append(entries) {
            Ok(ack) => {
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    if ack.wait().await.is_ok() {
                        let _ = tx.send(RaftEvent::LocalDurable);
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "local append failed");
                for waiter in self.commit_waiters.drain(..) {
                    let _ = waiter.tx.send(Err(Error::Durability {
                        reason: "local log append failed".into(),
                    }));
                }
            }
        }
    }

    fn broadcast_append(&mut self) {
        let peers: Vec<NodeId> = match &self.role {
            Role::Leader(leader) => leader.progress.peers().collect(),
            _ => return,
        };
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let base = self.wal.base_index();
        let term = self.term;
        let leader_commit = self.commit_index;
        let leader_id = self.id;
        let snapshots_dir = self.snapshots_dir.clone();
        let transport = Arc::clone(&self.transport);
        let event_tx = self.event_tx.clone();
        let wal = Arc::clone(&self.wal);

        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(peer) else {
            return;
        };
        if progress.inflight {
            return;
        }
        leader.seq += 1;
        let seq = leader.seq;

        if progress.next_index <= base {
            // The follower needs history the log no longer has.
            let snapshot = match snapshot::find_latest(&snapshots_dir) {
                Ok(Some(file)) => file,
                Ok(None) => {
                    warn!(peer = %peer, "follower behind compaction but no snapshot on disk");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "cannot enumerate snapshots");
                    return;
                }
            };
            progress.inflight = true;
            let snapshot_index = snapshot.meta.snapshot_index;
            let snapshot_term = snapshot.meta.snapshot_term;
            tokio::spawn(async move {
                let result = match tokio::task::spawn_blocking(move || std::fs::read(snapshot.path))
                    .await
                {
                    Ok(Ok(data)) => {
                        transport
                            .install_snapshot(
                                peer,
                                InstallSnapshotRequest {
                                    term,
                                    leader: leader_id,
                                    snapshot_index,
                                    snapshot_term,
                                    data,
                                },
                            )
                            .await
                    }
                    Ok(Err(e)) => Err(Error::Snapshot {
                        reason: format!("read snapshot file: {e}"),
                    }),
                    Err(e) => Err(Error::Snapshot {
                        reason: format!("snapshot read task: {e}"),
                    }),
                };
                let _ = event_tx.send(RaftEvent::SnapshotResult {
                    peer,
                    seq,
                    snapshot_index,
                    result,
                });
            });
            return;
        }

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = match wal.entry_term(prev_log_index) {
            Some(t) => t,
            None => {
                // Compacted between checks; the snapshot path picks this
                // peer up on the next send.
                progress.next_index = base;
                return;
            }
        };
        let entries = wal.entries_from(progress.next_index, REPLICATION_BATCH_BYTES);
        let sent_to = prev_log_index + entries.len() as u64;
        progress.inflight = true;
        let req = AppendEntriesRequest {
            term,
            leader: leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };
        tokio::spawn(async move {
            let result = transport.append_entries(peer, req).await;
            let _ = event_tx.send(RaftEvent::AppendResult {
                peer,
                seq,
                sent_to,
                result,
            });
        });
    }

    fn on_append_result(
        &mut self,
        peer: NodeId,
        seq: u64,
        sent_to: LogIndex,
        result: Result<AppendEntriesResponse>,
    ) {
        let resp = {
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            let Some(progress) = leader.progress.get_mut(peer) else {
                return;
            };
            progress.inflight = false;
            match result {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "append entries failed");
                    return;
                }
            }
        };
        if resp.term > self.term {
            self.step_down(resp.term, None);
            return;
        }
        if resp.success {
            let more = {
                let Role::Leader(leader) = &mut self.role else {
                    return;
                };
                let Some(progress) = leader.progress.get_mut(peer) else {
                    return;
                };
                let matched = resp.match_index.min(sent_to).max(progress.match_index);
                progress.match_index = matched;
                progress.next_index = matched + 1;
                progress.acked_seq = progress.acked_seq.max(seq);
                progress.last_ack = Some(Instant::now());
                progress.next_index <= self.wal.last_index()
            };
            self.advance_commit();
            self.complete_pending_reads();
            if more {
                self.send_append(peer);
            }
        } else {
            {
                let Role::Leader(leader) = &mut self.role else {
                    return;
                };
                let Some(progress) = leader.progress.get_mut(peer) else {
                    return;
                };
                let backed = resp
                    .conflict_hint
                    .unwrap_or_else(|| progress.next_index.saturating_sub(1));
                progress.next_index = backed.min(progress.next_index.saturating_sub(1)).max(1);
                debug!(peer = %peer, next = progress.next_index, "follower rejected append, backing off");
            }
            self.send_append(peer);
        }
    }

    fn on_snapshot_result(
        &mut self,
        peer: NodeId,
        seq: u64,
        snapshot_index: LogIndex,
        result: Result<InstallSnapshotResponse>,
    ) {
        let resp = {
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            let Some(progress) = leader.progress.get_mut(peer) else {
                return;
            };
            progress.inflight = false;
            match result {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "snapshot install failed");
                    return;
                }
            }
        };
        if resp.term > self.term {
            self.step_down(resp.term, None);
            return;
        }
        {
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            let Some(progress) = leader.progress.get_mut(peer) else {
                return;
            };
            progress.match_index = progress.match_index.max(snapshot_index);
            progress.next_index = snapshot_index + 1;
            progress.acked_seq = progress.acked_seq.max(seq);
            progress.last_ack = Some(Instant::now());
        }
        info!(peer = %peer, snapshot_index, "snapshot installed on follower");
        self.send_append(peer);
    }

    /// Advance commit to the highest index a majority holds durably, but
    /// only over entries from the current term.
    fn advance_commit(&mut self) {
        let durable = self.wal.durable_index();
        let candidate = {
            let Role::Leader(leader) = &self.role else {
                return;
            };
            leader
                .progress
                .quorum_match(durable, self.config.majority())
        };
        if candidate <= self.commit_index {
            return;
        }
        if self.wal.entry_term(candidate) != Some(self.term) {
            return;
        }
        self.commit_index = candidate;
        let _ = self.commit_tx.send(candidate);
        if let Err(e) = self.persist_hard_state() {
            warn!(error = %e, "failed to persist commit index");
        }
        debug!(commit = candidate, "commit index advanced");
        self.resolve_commit_waiters();
        self.publish_status();
    }

    fn resolve_commit_waiters(&mut self) {
        let commit = self.commit_index;
        let wal = Arc::clone(&self.wal);
        let mut remaining = Vec::with_capacity(self.commit_waiters.len());
        for waiter in self.commit_waiters.drain(..) {
            if waiter.index > commit {
                remaining.push(waiter);
                continue;
            }
            let outcome = if wal.entry_term(waiter.index) == Some(waiter.term) {
                Ok((waiter.term, waiter.index))
            } else {
                Err(Error::ReplicationFailed {
                    reason: "entry overwritten by a newer leader".into(),
                })
            };
            let _ = waiter.tx.send(outcome);
        }
        self.commit_waiters = remaining;
    }

    // ------------------------------------------------------------------
    // Read barrier support

    fn on_read_index(&mut self, reply: oneshot::Sender<Result<LogIndex>>) {
        let commit = self.commit_index;
        let majority = self.config.majority();
        let needs_round = {
            let Role::Leader(leader) = &mut self.role else {
                let _ = reply.send(Err(Error::NotLeader {
                    leader_hint: self.leader_hint,
                }));
                return;
            };
            // Confirmation needs acks to requests issued after this point.
            let round_seq = leader.seq + 1;
            if leader.progress.acks_at_or_after(round_seq) >= majority {
                let _ = reply.send(Ok(commit));
                false
            } else {
                leader.pending_reads.push(PendingRead {
                    round_seq,
                    read_index: commit,
                    started: Instant::now(),
                    tx: reply,
                });
                leader.next_heartbeat = Instant::now();
                true
            }
        };
        if needs_round {
            self.broadcast_append();
        }
    }

    fn complete_pending_reads(&mut self) {
        let majority = self.config.majority();
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let mut remaining = Vec::with_capacity(leader.pending_reads.len());
        for pending in leader.pending_reads.drain(..) {
            if leader.progress.acks_at_or_after(pending.round_seq) >= majority {
                let _ = pending.tx.send(Ok(pending.read_index));
            } else {
                remaining.push(pending);
            }
        }
        leader.pending_reads = remaining;
    }

    fn expire_pending_reads(&mut self) {
        let timeout = self.config.request_timeout();
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let now = Instant::now();
        let mut remaining = Vec::with_capacity(leader.pending_reads.len());
        for pending in leader.pending_reads.drain(..) {
            if now.duration_since(pending.started) > timeout {
                let _ = pending.tx.send(Err(Error::QuorumUnavailable {
                    reason: "leadership confirmation round timed out".into(),
                }));
            } else {
                remaining.push(pending);
            }
        }
        leader.pending_reads = remaining;
    }
}
