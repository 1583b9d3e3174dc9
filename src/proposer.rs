use crate::command::{Command, Mutation};
use crate::config::NodeConfig;
use crate::raft::RaftHandle;
use crate::wire::{encode_command, EntryKind};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Pending writes the proposer will accept before enqueue starts blocking
/// callers. The blocking itself is the back-pressure signal.
const QUEUE_DEPTH: usize = 1024;

struct Pending {
    mutation: Mutation,
    size: u64,
    done: oneshot::Sender<Result<()>>,
}

/// Coalesces concurrent writes on the leader into one log entry, hiding
/// the per-entry consensus round trip. All commands in a batch share one
/// `(term, index)` and succeed or fail together.
#[derive(Debug, Clone)]
pub struct Proposer {
    tx: mpsc::Sender<Pending>,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("size", &self.size).finish()
    }
}

impl Proposer {
    pub fn spawn(
        config: Arc<NodeConfig>,
        raft: RaftHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Proposer {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(batch_loop(config, raft, rx, shutdown));
        Proposer { tx }
    }

    /// Enqueue one mutation and wait for its batch to commit. Blocks on a
    /// full queue; that latency is the intended flow-control signal.
    pub async fn submit(&self, mutation: Mutation) -> Result<()> {
        let size = mutation.approximate_size();
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Pending {
                mutation,
                size,
                done,
            })
            .await
            .map_err(|_| Error::ProposerClosed)?;
        rx.await.map_err(|_| Error::ProposerClosed)?
    }
}

async fn batch_loop(
    config: Arc<NodeConfig>,
    raft: RaftHandle,
    mut rx: mpsc::Receiver<Pending>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let first = tokio::select! {
            pending = rx.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let mut batch = vec![first];
        let mut bytes = batch[0].size;
        // The wait clock starts at the oldest enqueued command.
        let deadline = tokio::time::Instant::now() + config.batch_max_wait();
        while batch.len() < config.batch_max_size && bytes < config.batch_max_bytes {
            tokio::select! {
                pending = rx.recv() => match pending {
                    Some(pending) => {
                        bytes += pending.size;
                        batch.push(pending);
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        debug!(commands = batch.len(), bytes, "proposing batch");
        let (mutations, handles): (Vec<Mutation>, Vec<oneshot::Sender<Result<()>>>) = batch
            .into_iter()
            .map(|p| (p.mutation, p.done))
            .unzip();
        let command = Command::from_batch(mutations);

        let outcome = propose_batch(&config, &raft, &command).await;
        match outcome {
            Ok(()) => {
                for handle in handles {
                    let _ = handle.send(Ok(()));
                }
            }
            Err(e) => {
                // All-or-nothing at the batch boundary: every caller gets
                // the same error class.
                warn!(error = %e, "batch proposal failed");
                for handle in handles {
                    let _ = handle.send(Err(same_class(&e)));
                }
            }
        }
    }
    debug!("proposer stopped");
}

async fn propose_batch(config: &NodeConfig, raft: &RaftHandle, command: &Command) -> Result<()> {
    let payload = encode_command(command)?;
    match tokio::time::timeout(
        config.request_timeout(),
        raft.propose(EntryKind::Command, payload),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::ReplicationFailed {
            reason: format!(
                "commit not confirmed within {}ms",
                config.request_timeout_ms
            ),
        }),
    }
}

/// Reproduce an error for each waiter in a failed batch. Error values
/// are not clonable (they may wrap io errors), so rebuild the variants
/// the proposer can actually see.
fn same_class(e: &Error) -> Error {
    match e {
        Error::NotLeader { leader_hint } => Error::NotLeader {
            leader_hint: *leader_hint,
        },
        Error::NoLeader => Error::NoLeader,
        Error::QuorumUnavailable { reason } => Error::QuorumUnavailable {
            reason: reason.clone(),
        },
        Error::ReplicationFailed { reason } => Error::ReplicationFailed {
            reason: reason.clone(),
        },
        Error::Durability { reason } => Error::Durability {
            reason: reason.clone(),
        },
        other => Error::ReplicationFailed {
            reason: other.to_string(),
        },
    }
}
