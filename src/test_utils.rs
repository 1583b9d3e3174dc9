//! In-process cluster harness. Nodes talk over an in-memory transport
//! with a partition map, so consensus behavior (elections, replication,
//! partitions, catch-up) is exercised without sockets.

use crate::config::{BarrierFailureMode, BlobStoreConfig, NodeConfig, ReadBarrierConfig};
use crate::node::ConfmanNode;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::RoleKind;
use crate::store::MemoryStore;
use crate::transport::Transport;
use crate::{Error, LogIndex, NodeId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Shared mesh state: who is up, and which links are cut.
#[derive(Debug, Default)]
pub struct LocalRouter {
    nodes: DashMap<NodeId, Arc<ConfmanNode>>,
    partitions: DashMap<(NodeId, NodeId), ()>,
}

impl LocalRouter {
    pub fn register(&self, id: NodeId, node: Arc<ConfmanNode>) {
        self.nodes.insert(id, node);
    }

    pub fn deregister(&self, id: NodeId) {
        self.nodes.remove(&id);
    }

    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.partitions.insert((a, b), ());
        self.partitions.insert((b, a), ());
    }

    pub fn heal(&self, a: NodeId, b: NodeId) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    pub fn heal_all(&self) {
        self.partitions.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<ConfmanNode>> {
        if self.partitions.contains_key(&(from, to)) {
            return Err(Error::Transport {
                peer: to,
                reason: "network partition".into(),
            });
        }
        self.nodes
            .get(&to)
            .map(|n| Arc::clone(n.value()))
            .ok_or(Error::Transport {
                peer: to,
                reason: "node is down".into(),
            })
    }
}

/// Transport that calls straight into the target node's handlers.
#[derive(Debug)]
pub struct LocalTransport {
    from: NodeId,
    router: Arc<LocalRouter>,
}

impl LocalTransport {
    pub fn new(from: NodeId, router: Arc<LocalRouter>) -> Self {
        LocalTransport { from, router }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.router.route(self.from, to)?.raft().handle_request_vote(req).await
    }

    async fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.router
            .route(self.from, to)?
            .raft()
            .handle_append_entries(req)
            .await
    }

    async fn install_snapshot(
        &self,
        to: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.router
            .route(self.from, to)?
            .raft()
            .handle_install_snapshot(req)
            .await
    }

    async fn read_index(&self, to: NodeId) -> Result<LogIndex> {
        self.router.route(self.from, to)?.handle_read_index().await
    }

    async fn put_blob(&self, to: NodeId, blob_id: &str, compressed: Bytes) -> Result<()> {
        self.router
            .route(self.from, to)?
            .handle_put_blob(blob_id, compressed)
            .await
    }

    async fn fetch_blob(&self, to: NodeId, blob_id: &str) -> Result<Bytes> {
        let bytes = self
            .router
            .route(self.from, to)?
            .handle_get_blob(blob_id)
            .await?;
        Ok(Bytes::from(bytes))
    }
}

/// Knobs for cluster tests; the defaults keep elections and flushes fast
/// enough for sub-second assertions.
#[derive(Debug, Clone)]
pub struct TestClusterOptions {
    pub nodes: usize,
    pub snapshot_interval: u64,
    pub inline_threshold_bytes: u64,
    pub batch_max_size: usize,
    pub batch_max_wait_ms: u64,
    pub barrier_mode: BarrierFailureMode,
    pub blob_enabled: bool,
}

impl Default for TestClusterOptions {
    fn default() -> Self {
        Self {
            nodes: 3,
            snapshot_interval: 10_000,
            inline_threshold_bytes: 64 * 1024,
            batch_max_size: 50,
            batch_max_wait_ms: 1,
            barrier_mode: BarrierFailureMode::Reject,
            blob_enabled: true,
        }
    }
}

pub fn test_node_config(index: usize, options: &TestClusterOptions, root: &Path) -> NodeConfig {
    NodeConfig {
        members: (0..options.nodes).map(|i| format!("local-{i}")).collect(),
        node_id: index as u64,
        data_path: root.join(format!("node-{index}")),
        election_timeout_lower_ms: 150,
        election_timeout_upper_ms: 300,
        heartbeat_threshold: 0.5,
        request_timeout_ms: 1_000,
        snapshot_interval: options.snapshot_interval,
        flush_interval_ms: 2,
        flush_max_bytes: 4 * 1024 * 1024,
        wal_chunk_max_bytes: 256 * 1024,
        batch_max_size: options.batch_max_size,
        batch_max_bytes: 4 * 1024 * 1024,
        batch_max_wait_ms: options.batch_max_wait_ms,
        read_barrier: ReadBarrierConfig {
            enabled: true,
            failure_mode: options.barrier_mode,
            timeout_ms: 2_000,
        },
        blob_store: BlobStoreConfig {
            enabled: options.blob_enabled,
            inline_threshold_bytes: options.inline_threshold_bytes,
            max_blob_size_bytes: 64 * 1024 * 1024,
            cluster_token: "test-cluster-token".into(),
            gc_interval_secs: 3_600,
            gc_grace_secs: 3_600,
        },
    }
}

pub struct TestCluster {
    pub router: Arc<LocalRouter>,
    pub nodes: Vec<Option<Arc<ConfmanNode>>>,
    pub options: TestClusterOptions,
    root: PathBuf,
}

impl TestCluster {
    /// Start `options.nodes` nodes rooted under `root` (the caller owns
    /// the directory's lifetime, typically a tempdir).
    pub async fn start(root: &Path, options: TestClusterOptions) -> Result<TestCluster> {
        let router = Arc::new(LocalRouter::default());
        let mut cluster = TestCluster {
            router,
            nodes: (0..options.nodes).map(|_| None).collect(),
            options,
            root: root.to_path_buf(),
        };
        for i in 0..cluster.options.nodes {
            cluster.start_node(i).await?;
        }
        Ok(cluster)
    }

    pub async fn start_node(&mut self, index: usize) -> Result<()> {
        let config = test_node_config(index, &self.options, &self.root);
        let id = config.id();
        let transport = Arc::new(LocalTransport::new(id, Arc::clone(&self.router)));
        let node = ConfmanNode::start(config, transport, Arc::new(MemoryStore::new())).await?;
        self.router.register(id, Arc::clone(&node));
        self.nodes[index] = Some(node);
        Ok(())
    }

    /// Stop a node and drop it from the mesh, as an abrupt kill.
    pub fn stop_node(&mut self, index: usize) {
        if let Some(node) = self.nodes[index].take() {
            self.router.deregister(NodeId(index as u64));
            node.shutdown();
        }
    }

    pub fn node(&self, index: usize) -> Arc<ConfmanNode> {
        Arc::clone(self.nodes[index].as_ref().expect("node is running"))
    }

    pub fn running(&self) -> impl Iterator<Item = (usize, &Arc<ConfmanNode>)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (i, n)))
    }

    /// Index of the current leader, if exactly one node claims the role.
    pub fn leader_index(&self) -> Option<usize> {
        let leaders: Vec<usize> = self
            .running()
            .filter(|(_, n)| n.status().role == RoleKind::Leader)
            .map(|(i, _)| i)
            .collect();
        match leaders.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader_index() {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NoLeader);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until every running node knows the same leader.
    pub async fn wait_for_stable_leader(&self, timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leader = self.leader_index();
            if let Some(leader) = leader {
                let id = NodeId(leader as u64);
                if self.running().all(|(_, n)| n.status().leader == Some(id)) {
                    return Ok(leader);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NoLeader);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn partition(&self, a: usize, b: usize) {
        self.router.partition(NodeId(a as u64), NodeId(b as u64));
    }

    pub fn heal_all(&self) {
        self.router.heal_all();
    }

    /// Cut one node off from every other node.
    pub fn isolate(&self, index: usize) {
        for other in 0..self.options.nodes {
            if other != index {
                self.partition(index, other);
            }
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.iter().flatten() {
            node.shutdown();
        }
    }
}
