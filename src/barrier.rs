use crate::config::{BarrierFailureMode, NodeConfig};
use crate::raft::{RaftHandle, RoleKind};
use crate::transport::Transport;
use crate::{Error, LogIndex, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Pause between attempts while a leader is being elected.
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// What a completed barrier promises about the data served after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadGuarantee {
    /// Every acknowledged write is visible.
    Linearizable,
    /// The barrier could not be established (or is disabled); data may
    /// lag behind acknowledged writes.
    Stale,
}

/// Gates reads on a quorum-confirmed commit index: the node serves only
/// after its applier has caught up to a read index the leader confirmed
/// with a majority round.
#[derive(Debug)]
pub struct ReadBarrier {
    config: Arc<NodeConfig>,
    raft: RaftHandle,
    transport: Arc<dyn Transport>,
    applied_rx: watch::Receiver<LogIndex>,
}

impl ReadBarrier {
    pub fn new(
        config: Arc<NodeConfig>,
        raft: RaftHandle,
        transport: Arc<dyn Transport>,
        applied_rx: watch::Receiver<LogIndex>,
    ) -> Self {
        ReadBarrier {
            config,
            raft,
            transport,
            applied_rx,
        }
    }

    /// Establish the barrier, honoring the configured failure mode when
    /// it cannot be done in time. Cancelling the returned future (client
    /// disconnect) abandons the wait without side effects.
    pub async fn acquire(&self) -> Result<ReadGuarantee> {
        if !self.config.read_barrier.enabled {
            return Ok(ReadGuarantee::Stale);
        }
        let timeout = self.config.barrier_timeout();
        match tokio::time::timeout(timeout, self.establish()).await {
            Ok(Ok(())) => Ok(ReadGuarantee::Linearizable),
            Ok(Err(e)) => self.on_failure(e),
            Err(_) => self.on_failure(Error::BarrierTimeout {
                timeout_ms: self.config.read_barrier.timeout_ms,
            }),
        }
    }

    async fn establish(&self) -> Result<()> {
        loop {
            match self.try_once().await {
                Ok(()) => return Ok(()),
                // Leadership is in flux; retry until the outer timeout.
                Err(
                    Error::NotLeader { .. }
                    | Error::NoLeader
                    | Error::QuorumUnavailable { .. }
                    | Error::Transport { .. },
                ) => {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_once(&self) -> Result<()> {
        let status = self.raft.status();
        let read_index = if status.role == RoleKind::Leader {
            self.raft.read_index().await?
        } else if let Some(leader) = status.leader.filter(|l| *l != status.id) {
            self.transport.read_index(leader).await?
        } else {
            return Err(Error::NoLeader);
        };
        debug!(read_index, "read barrier established, waiting for applier");

        let mut applied = self.applied_rx.clone();
        while *applied.borrow() < read_index {
            applied
                .changed()
                .await
                .map_err(|_| Error::QuorumUnavailable {
                    reason: "applier has shut down".into(),
                })?;
        }
        Ok(())
    }

    fn on_failure(&self, cause: Error) -> Result<ReadGuarantee> {
        match self.config.read_barrier.failure_mode {
            BarrierFailureMode::Stale => {
                warn!(error = %cause, "read barrier failed, serving possibly stale data");
                Ok(ReadGuarantee::Stale)
            }
            BarrierFailureMode::Reject | BarrierFailureMode::Timeout => {
                Err(Error::BarrierTimeout {
                    timeout_ms: self.config.read_barrier.timeout_ms,
                })
            }
        }
    }
}
