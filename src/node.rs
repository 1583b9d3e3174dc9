use crate::applier::{Applier, ApplierHandle, SnapshotInstall};
use crate::barrier::{ReadBarrier, ReadGuarantee};
use crate::blob::replicator::BlobReplicator;
use crate::blob::resolver::BlobResolver;
use crate::blob::store::BlobStore;
use crate::command::Mutation;
use crate::config::NodeConfig;
use crate::model::{AuditEvent, ConfigEntry, Namespace, ValueType};
use crate::proposer::Proposer;
use crate::raft::{RaftHandle, RaftNode, RaftStatus, RoleKind};
use crate::store::MaterializedStore;
use crate::transport::Transport;
use crate::wal::{Wal, WalOptions};
use crate::{Error, LogIndex, NodeId, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Everything the blob side-channel needs, present only when enabled.
#[derive(Debug)]
struct BlobPipeline {
    store: Arc<BlobStore>,
    replicator: BlobReplicator,
    resolver: BlobResolver,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub last_index: LogIndex,
    pub members: Vec<String>,
}

/// One confman node: consensus, log, applier, proposer, barrier, and the
/// blob side-channel, wired together over a shared transport.
#[derive(Debug)]
pub struct ConfmanNode {
    config: Arc<NodeConfig>,
    raft: RaftHandle,
    store: Arc<dyn MaterializedStore>,
    applier: ApplierHandle,
    proposer: Proposer,
    barrier: ReadBarrier,
    blobs: Option<BlobPipeline>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConfmanNode {
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MaterializedStore>,
    ) -> Result<Arc<ConfmanNode>> {
        config.validate()?;
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_path)?;

        let wal = Wal::open(
            &config.wal_dir(),
            WalOptions {
                flush_interval: config.flush_interval(),
                flush_max_bytes: config.flush_max_bytes,
                chunk_max_bytes: config.wal_chunk_max_bytes,
            },
        )?;

        let blob_store = if config.blob_store.enabled {
            Some(Arc::new(BlobStore::open(
                &config.blobs_dir(),
                config.blob_store.max_blob_size_bytes,
            )?))
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (install_tx, install_rx) = mpsc::channel::<SnapshotInstall>(1);

        let raft = RaftNode::spawn(
            Arc::clone(&config),
            Arc::clone(&wal),
            Arc::clone(&transport),
            install_tx,
            shutdown_rx.clone(),
        );

        let applier = Applier::spawn(
            Arc::clone(&config),
            Arc::clone(&wal),
            Arc::clone(&store),
            blob_store.clone(),
            raft.commit_watch(),
            install_rx,
            shutdown_rx.clone(),
        )
        .await?;

        let proposer = Proposer::spawn(Arc::clone(&config), raft.clone(), shutdown_rx.clone());
        let barrier = ReadBarrier::new(
            Arc::clone(&config),
            raft.clone(),
            Arc::clone(&transport),
            applier.applied_watch(),
        );

        let blobs = blob_store.map(|blob_store| BlobPipeline {
            replicator: BlobReplicator::new(
                Arc::clone(&transport),
                config.peers(),
                config.majority(),
            ),
            resolver: BlobResolver::new(
                Arc::clone(&blob_store),
                Arc::clone(&transport),
                config.peers(),
            ),
            store: blob_store,
        });

        let node = Arc::new(ConfmanNode {
            config: Arc::clone(&config),
            raft,
            store,
            applier,
            proposer,
            barrier,
            blobs,
            shutdown_tx,
        });

        if node.blobs.is_some() {
            tokio::spawn(Arc::clone(&node).blob_gc_loop(shutdown_rx));
        }
        info!(node = %config.id(), members = config.members.len(), "node started");
        Ok(node)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn status(&self) -> ClusterStatus {
        let raft: RaftStatus = self.raft.status();
        ClusterStatus {
            id: raft.id,
            role: raft.role,
            term: raft.term,
            leader: raft.leader,
            leader_addr: raft
                .leader
                .and_then(|l| self.config.member_addr(l).map(String::from)),
            commit_index: raft.commit_index,
            applied_index: self.applier.applied_index(),
            last_index: raft.last_index,
            members: self.config.members.clone(),
        }
    }

    /// Readiness: part of a quorum with a known leader.
    pub fn is_ready(&self) -> bool {
        self.raft.status().leader.is_some()
    }

    pub fn verify_cluster_token(&self, presented: &str) -> bool {
        let expected = self.config.blob_store.cluster_token.as_bytes();
        presented.as_bytes().ct_eq(expected).into()
    }

    // ------------------------------------------------------------------
    // Write path

    /// Store one configuration value. Values at or past the inline
    /// threshold go through the blob side-channel: durable quorum first,
    /// then the pointer through consensus.
    pub async fn put_config(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        value_type: ValueType,
        author: &str,
    ) -> Result<()> {
        let timestamp = chrono::Utc::now();
        let mutation = match &self.blobs {
            Some(blobs) if value.len() as u64 >= self.config.blob_store.inline_threshold_bytes => {
                let blob_id = self.stage_blob(blobs, value).await?;
                Mutation::SetConfigBlobRef {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    blob_id,
                    value_type,
                    author: author.to_string(),
                    timestamp,
                }
            }
            _ => Mutation::SetConfig {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value,
                value_type,
                author: author.to_string(),
                timestamp,
            },
        };
        self.proposer.submit(mutation).await
    }

    /// Durable-blob-first: local store, quorum push, only then is the
    /// content-addressed pointer allowed into the log. A blob whose
    /// pointer never commits is an orphan the sweeper collects later.
    async fn stage_blob(&self, blobs: &BlobPipeline, value: Vec<u8>) -> Result<String> {
        let store = Arc::clone(&blobs.store);
        let (blob_id, _compressed_len) = tokio::task::spawn_blocking(move || store.put_value(&value))
            .await
            .map_err(|e| Error::Durability {
                reason: format!("blob write task: {e}"),
            })??;
        let store = Arc::clone(&blobs.store);
        let id = blob_id.clone();
        let compressed = tokio::task::spawn_blocking(move || store.read_compressed(&id))
            .await
            .map_err(|e| Error::Durability {
                reason: format!("blob read task: {e}"),
            })??;
        blobs
            .replicator
            .replicate_quorum(&blob_id, Bytes::from(compressed))
            .await?;
        Ok(blob_id)
    }

    pub async fn delete_config(&self, namespace: &str, key: &str, author: &str) -> Result<()> {
        self.proposer
            .submit(Mutation::DeleteConfig {
                namespace: namespace.to_string(),
                key: key.to_string(),
                author: author.to_string(),
                timestamp: chrono::Utc::now(),
            })
            .await
    }

    pub async fn put_namespace(
        &self,
        path: &str,
        description: &str,
        owner: &str,
        author: &str,
    ) -> Result<()> {
        self.proposer
            .submit(Mutation::SetNamespace {
                path: path.to_string(),
                description: description.to_string(),
                owner: owner.to_string(),
                author: author.to_string(),
                timestamp: chrono::Utc::now(),
            })
            .await
    }

    pub async fn delete_namespace(&self, path: &str, author: &str) -> Result<()> {
        self.proposer
            .submit(Mutation::DeleteNamespace {
                path: path.to_string(),
                author: author.to_string(),
                timestamp: chrono::Utc::now(),
            })
            .await
    }

    // ------------------------------------------------------------------
    // Read path (barrier applied)

    /// Read one entry and its value bytes. Blob-backed values resolve
    /// through the local store or any live peer.
    pub async fn get_config(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<(ConfigEntry, Vec<u8>, ReadGuarantee)> {
        let guarantee = self.barrier.acquire().await?;
        let entry = self
            .store
            .get_config(namespace, key)
            .await?
            .ok_or_else(|| Error::KeyNotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;
        let value = match &entry.blob_id {
            Some(blob_id) => {
                let blobs = self.blobs.as_ref().ok_or_else(|| {
                    Error::Config("blob-backed entry but the blob store is disabled".into())
                })?;
                blobs.resolver.resolve(blob_id).await?
            }
            None => entry.value.clone().unwrap_or_default(),
        };
        Ok((entry, value, guarantee))
    }

    pub async fn list_configs(
        &self,
        namespace: &str,
    ) -> Result<(Vec<ConfigEntry>, ReadGuarantee)> {
        let guarantee = self.barrier.acquire().await?;
        Ok((self.store.list_configs(namespace).await?, guarantee))
    }

    pub async fn get_namespace(&self, path: &str) -> Result<(Namespace, ReadGuarantee)> {
        let guarantee = self.barrier.acquire().await?;
        let ns = self
            .store
            .get_namespace(path)
            .await?
            .ok_or_else(|| Error::NamespaceNotFound(path.to_string()))?;
        Ok((ns, guarantee))
    }

    pub async fn list_namespaces(&self) -> Result<(Vec<Namespace>, ReadGuarantee)> {
        let guarantee = self.barrier.acquire().await?;
        Ok((self.store.list_namespaces().await?, guarantee))
    }

    pub async fn list_audit(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<(Vec<AuditEvent>, ReadGuarantee)> {
        let guarantee = self.barrier.acquire().await?;
        Ok((self.store.list_audit(namespace, limit).await?, guarantee))
    }

    // ------------------------------------------------------------------
    // Internal endpoints (inter-node)

    pub async fn handle_read_index(&self) -> Result<LogIndex> {
        self.raft.read_index().await
    }

    pub async fn handle_put_blob(&self, blob_id: &str, compressed: Bytes) -> Result<()> {
        let blobs = self.require_blobs()?;
        let store = Arc::clone(&blobs.store);
        let id = blob_id.to_string();
        tokio::task::spawn_blocking(move || store.put_compressed(&id, &compressed))
            .await
            .map_err(|e| Error::Durability {
                reason: format!("blob write task: {e}"),
            })?
    }

    pub async fn handle_get_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        let blobs = self.require_blobs()?;
        let store = Arc::clone(&blobs.store);
        let id = blob_id.to_string();
        tokio::task::spawn_blocking(move || store.read_compressed(&id))
            .await
            .map_err(|e| Error::Durability {
                reason: format!("blob read task: {e}"),
            })?
    }

    fn require_blobs(&self) -> Result<&BlobPipeline> {
        self.blobs
            .as_ref()
            .ok_or_else(|| Error::Config("blob store is disabled".into()))
    }

    // ------------------------------------------------------------------
    // Background maintenance

    async fn blob_gc_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.blob_store.gc_interval_secs.max(1));
        let grace = Duration::from_secs(self.config.blob_store.gc_grace_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // The first tick fires immediately; skip it.
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.blob_gc_once(grace).await {
                warn!(error = %e, "blob gc sweep failed");
            }
        }
    }

    async fn blob_gc_once(&self, grace: Duration) -> Result<()> {
        let Some(blobs) = &self.blobs else {
            return Ok(());
        };
        let live: HashSet<String> = self
            .store
            .all_configs()
            .await?
            .into_iter()
            .filter_map(|c| c.blob_id)
            .collect();
        let store = Arc::clone(&blobs.store);
        tokio::task::spawn_blocking(move || store.gc_sweep(&live, grace))
            .await
            .map_err(|e| Error::Durability {
                reason: format!("gc task: {e}"),
            })??;
        Ok(())
    }
}
