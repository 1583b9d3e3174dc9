use crate::command::{Command, Mutation};
use crate::config::NodeConfig;
use crate::model::{
    audit_value_preview, AuditAction, AuditEvent, AuditVerb, Namespace, ResourceType,
};
use crate::snapshot::{self, SnapshotFile, SnapshotMeta, SnapshotReader};
use crate::store::{ConfigWrite, MaterializedStore};
use crate::wal::Wal;
use crate::wire::{decode_command, EntryKind, LogEntry};
use crate::{blob::store::BlobStore, Error, LogIndex, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Records restored per store round-trip during snapshot restore.
const RESTORE_CHUNK: usize = 1024;

/// A snapshot received from the leader, to be installed by the applier
/// (which owns all mutation of the materialized store).
pub struct SnapshotInstall {
    pub file: SnapshotFile,
    pub reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone)]
pub struct ApplierHandle {
    applied_rx: watch::Receiver<LogIndex>,
}

impl ApplierHandle {
    pub fn applied_index(&self) -> LogIndex {
        *self.applied_rx.borrow()
    }

    pub fn applied_watch(&self) -> watch::Receiver<LogIndex> {
        self.applied_rx.clone()
    }
}

/// The single logical worker that folds committed entries into the
/// materialized store, in strictly increasing index order, exactly once.
pub struct Applier {
    config: Arc<NodeConfig>,
    wal: Arc<Wal>,
    store: Arc<dyn MaterializedStore>,
    blobs: Option<Arc<BlobStore>>,
    applied: LogIndex,
    /// Commands (batch inners counted individually) since the last
    /// snapshot.
    commands_since_snapshot: u64,
    applied_tx: watch::Sender<LogIndex>,
}

impl Applier {
    /// Restore the materialized store from the newest local snapshot (if
    /// any), then start the apply loop. Returns once bootstrap recovery
    /// is complete; replay of the log tail happens on the loop.
    pub async fn spawn(
        config: Arc<NodeConfig>,
        wal: Arc<Wal>,
        store: Arc<dyn MaterializedStore>,
        blobs: Option<Arc<BlobStore>>,
        commit_rx: watch::Receiver<LogIndex>,
        install_rx: mpsc::Receiver<SnapshotInstall>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ApplierHandle> {
        let mut applied = 0;
        if let Some(latest) = snapshot::find_latest(&config.snapshots_dir())? {
            info!(
                index = latest.meta.snapshot_index,
                "restoring materialized state from snapshot"
            );
            restore_into(&latest, store.as_ref(), blobs.as_deref()).await?;
            applied = latest.meta.snapshot_index;
        }
        // The log only holds entries past the compaction base, so the
        // snapshot must cover at least that much. A gap here means state
        // was lost and only an operator can decide what to do.
        if applied < wal.base_index() {
            return Err(Error::Snapshot {
                reason: format!(
                    "log compacted through {} but the newest readable snapshot covers only {applied}",
                    wal.base_index()
                ),
            });
        }

        let (applied_tx, applied_rx) = watch::channel(applied);
        let applier = Applier {
            config,
            wal,
            store,
            blobs,
            applied,
            commands_since_snapshot: 0,
            applied_tx,
        };
        tokio::spawn(applier.run(commit_rx, install_rx, shutdown));
        Ok(ApplierHandle { applied_rx })
    }

    async fn run(
        mut self,
        mut commit_rx: watch::Receiver<LogIndex>,
        mut install_rx: mpsc::Receiver<SnapshotInstall>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Catch up with whatever was committed before we started.
        let initial_target = *commit_rx.borrow();
        self.drain_committed(initial_target).await;
        // The tick covers the case where a committed-but-missing entry
        // arrives later through replication without the commit index
        // moving again.
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let target = *commit_rx.borrow();
                    self.drain_committed(target).await;
                }
                _ = tick.tick() => {
                    let target = *commit_rx.borrow();
                    self.drain_committed(target).await;
                }
                install = install_rx.recv() => match install {
                    Some(install) => {
                        let result = self.install_snapshot(&install.file).await;
                        let _ = install.reply.send(result);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("applier stopped");
    }

    async fn drain_committed(&mut self, target: LogIndex) {
        while self.applied < target {
            let index = self.applied + 1;
            let Some(entry) = self.wal.entry(index) else {
                // Not yet replicated locally (commit learned ahead of the
                // entries themselves); the next commit signal retries.
                return;
            };
            self.apply_entry(&entry).await;
            self.applied = index;
            let _ = self.applied_tx.send(index);

            if self.commands_since_snapshot >= self.config.snapshot_interval {
                if let Err(e) = self.take_snapshot().await {
                    // The node stays alive but cannot compact its log;
                    // an operator has to intervene. Resetting the counter
                    // spaces retries a full interval apart.
                    error!(error = %e, "snapshot persistence failed");
                    self.commands_since_snapshot = 0;
                }
            }
        }
    }

    async fn apply_entry(&mut self, entry: &LogEntry) {
        match entry.kind {
            EntryKind::Noop | EntryKind::Membership => return,
            EntryKind::Command => {}
        }
        let command = match decode_command(&entry.payload) {
            Ok(command) => command,
            Err(e) => {
                // Never fatal: a single undecodable entry must not stall
                // the apply loop forever.
                warn!(index = entry.index, error = %e, "skipping corrupt log entry");
                return;
            }
        };
        let count = command.command_count();
        match command {
            Command::Single(mutation) => {
                if let Err(e) = self.apply_mutation(&mutation).await {
                    warn!(index = entry.index, error = %e, "mutation failed");
                }
            }
            Command::Batch(mutations) => {
                // Inner failures are deterministic across replicas, so a
                // failed element is logged and the batch continues.
                for (pos, mutation) in mutations.iter().enumerate() {
                    if let Err(e) = self.apply_mutation(mutation).await {
                        warn!(
                            index = entry.index,
                            batch_pos = pos,
                            error = %e,
                            "batched mutation failed"
                        );
                    }
                }
            }
        }
        self.commands_since_snapshot += count;
    }

    async fn apply_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::SetConfig {
                namespace,
                key,
                value,
                value_type,
                author,
                timestamp,
            } => {
                let (old, stored) = self
                    .store
                    .set_config(ConfigWrite {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: Some(value.clone()),
                        blob_id: None,
                        value_type: *value_type,
                        updated_at: *timestamp,
                        updated_by: author.clone(),
                    })
                    .await?;
                self.audit_config_set(&old, &stored, author, *timestamp).await
            }
            Mutation::SetConfigBlobRef {
                namespace,
                key,
                blob_id,
                value_type,
                author,
                timestamp,
            } => {
                if let Some(blobs) = &self.blobs {
                    if !blobs.contains(blob_id) {
                        // Resolved lazily from a peer on first read.
                        debug!(blob_id, "blob-backed entry applied before local blob arrived");
                    }
                }
                let (old, stored) = self
                    .store
                    .set_config(ConfigWrite {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: None,
                        blob_id: Some(blob_id.clone()),
                        value_type: *value_type,
                        updated_at: *timestamp,
                        updated_by: author.clone(),
                    })
                    .await?;
                self.audit_config_set(&old, &stored, author, *timestamp).await
            }
            Mutation::DeleteConfig {
                namespace,
                key,
                author,
                timestamp,
            } => {
                let Some(old) = self.store.delete_config(namespace, key).await? else {
                    // Deleting a missing entry is a no-op and produces no
                    // audit event.
                    return Ok(());
                };
                self.store
                    .append_audit(AuditEvent {
                        id: AuditEvent::deterministic_id(*timestamp, namespace, key),
                        timestamp: *timestamp,
                        action: AuditAction {
                            resource: ResourceType::Config,
                            verb: AuditVerb::Deleted,
                        },
                        actor: author.clone(),
                        namespace: namespace.clone(),
                        key: key.clone(),
                        old_value: audit_value_preview(&old),
                        new_value: None,
                    })
                    .await
            }
            Mutation::SetNamespace {
                path,
                description,
                owner,
                author,
                timestamp,
            } => {
                let (old, stored) = self
                    .store
                    .set_namespace(Namespace {
                        path: path.clone(),
                        description: description.clone(),
                        owner: owner.clone(),
                        created_at: *timestamp,
                    })
                    .await?;
                let verb = if old.is_some() {
                    AuditVerb::Updated
                } else {
                    AuditVerb::Created
                };
                self.store
                    .append_audit(AuditEvent {
                        id: AuditEvent::deterministic_id(*timestamp, path, ""),
                        timestamp: *timestamp,
                        action: AuditAction {
                            resource: ResourceType::Namespace,
                            verb,
                        },
                        actor: author.clone(),
                        namespace: path.clone(),
                        key: String::new(),
                        old_value: old.map(|ns| ns.description),
                        new_value: Some(stored.description),
                    })
                    .await
            }
            Mutation::DeleteNamespace {
                path,
                author,
                timestamp,
            } => {
                let Some(old) = self.store.delete_namespace(path).await? else {
                    return Ok(());
                };
                self.store
                    .append_audit(AuditEvent {
                        id: AuditEvent::deterministic_id(*timestamp, path, ""),
                        timestamp: *timestamp,
                        action: AuditAction {
                            resource: ResourceType::Namespace,
                            verb: AuditVerb::Deleted,
                        },
                        actor: author.clone(),
                        namespace: path.clone(),
                        key: String::new(),
                        old_value: Some(old.description),
                        new_value: None,
                    })
                    .await
            }
        }
    }

    async fn audit_config_set(
        &self,
        old: &Option<crate::model::ConfigEntry>,
        stored: &crate::model::ConfigEntry,
        author: &str,
        timestamp: crate::model::Timestamp,
    ) -> Result<()> {
        let verb = if old.is_some() {
            AuditVerb::Updated
        } else {
            AuditVerb::Created
        };
        self.store
            .append_audit(AuditEvent {
                id: AuditEvent::deterministic_id(timestamp, &stored.namespace, &stored.key),
                timestamp,
                action: AuditAction {
                    resource: ResourceType::Config,
                    verb,
                },
                actor: author.to_string(),
                namespace: stored.namespace.clone(),
                key: stored.key.clone(),
                old_value: old.as_ref().and_then(audit_value_preview),
                new_value: audit_value_preview(stored),
            })
            .await
    }

    /// Serialize the full materialized state, then let the log discard
    /// everything the snapshot covers. Blocks the apply loop while it
    /// runs, so its duration must stay under the election timeout.
    async fn take_snapshot(&mut self) -> Result<()> {
        let started = std::time::Instant::now();
        let snapshot_index = self.applied;
        let snapshot_term = self
            .wal
            .entry_term(snapshot_index)
            .ok_or_else(|| Error::Snapshot {
                reason: format!("no term known for applied index {snapshot_index}"),
            })?;

        let configs = self.store.all_configs().await?;
        let namespaces = self.store.all_namespaces().await?;
        let audit_events = self.store.all_audit_events().await?;
        let manifest: Vec<String> = configs
            .iter()
            .filter_map(|c| c.blob_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let meta = SnapshotMeta {
            snapshot_index,
            snapshot_term,
            timestamp: chrono::Utc::now(),
        };
        let dir = self.config.snapshots_dir();
        tokio::task::spawn_blocking(move || {
            snapshot::write_snapshot(&dir, &meta, &configs, &namespaces, &audit_events, &manifest)
        })
        .await
        .map_err(|e| Error::Snapshot {
            reason: format!("snapshot writer task: {e}"),
        })??;

        self.wal.compact_through(snapshot_index).await?;
        snapshot::prune_old(&self.config.snapshots_dir(), 2)?;
        self.commands_since_snapshot = 0;

        let elapsed = started.elapsed();
        let budget = self.config.election_timeout_range().0 / 2;
        if elapsed > budget {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "snapshot took longer than half the election timeout; raise snapshot_interval or the timeouts"
            );
        } else {
            info!(
                index = snapshot_index,
                elapsed_ms = elapsed.as_millis() as u64,
                "snapshot complete"
            );
        }
        Ok(())
    }

    async fn install_snapshot(&mut self, file: &SnapshotFile) -> Result<()> {
        if file.meta.snapshot_index <= self.applied {
            // Already past this point; re-applying would move time
            // backwards for concurrent readers.
            return Ok(());
        }
        restore_into(file, self.store.as_ref(), self.blobs.as_deref()).await?;
        self.applied = file.meta.snapshot_index;
        self.commands_since_snapshot = 0;
        let _ = self.applied_tx.send(self.applied);
        info!(index = self.applied, "snapshot installed");
        Ok(())
    }
}

/// Clear the store and bulk-load a snapshot into it, in bounded chunks.
async fn restore_into(
    file: &SnapshotFile,
    store: &dyn MaterializedStore,
    blobs: Option<&BlobStore>,
) -> Result<()> {
    let mut reader = SnapshotReader::open(&file.path)?;
    store.clear().await?;
    while let Some(chunk) = reader.next_configs_chunk(RESTORE_CHUNK)? {
        store.insert_configs(chunk).await?;
    }
    while let Some(chunk) = reader.next_namespaces_chunk(RESTORE_CHUNK)? {
        store.insert_namespaces(chunk).await?;
    }
    while let Some(chunk) = reader.next_audit_chunk(RESTORE_CHUNK)? {
        store.insert_audit_events(chunk).await?;
    }
    let mut missing = 0usize;
    while let Some(chunk) = reader.next_manifest_chunk(RESTORE_CHUNK)? {
        if let Some(blobs) = blobs {
            for blob_id in &chunk {
                if !blobs.contains(blob_id) {
                    missing += 1;
                }
            }
        }
    }
    if missing > 0 {
        // Fetched lazily on first read, or by the background reconciler.
        info!(missing, "snapshot references blobs not yet local");
    }
    Ok(())
}
