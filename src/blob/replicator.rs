use crate::transport::Transport;
use crate::{Error, NodeId, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pushes a freshly written blob to peers and releases the caller the
/// moment a durability quorum (counting this node) is reached. Pushes to
/// the remaining peers keep running in the background; their cancellation
/// scope is the process, never the originating request.
#[derive(Debug, Clone)]
pub struct BlobReplicator {
    transport: Arc<dyn Transport>,
    peers: Vec<NodeId>,
    majority: usize,
}

impl BlobReplicator {
    pub fn new(transport: Arc<dyn Transport>, peers: Vec<NodeId>, majority: usize) -> Self {
        BlobReplicator {
            transport,
            peers,
            majority,
        }
    }

    /// Block until `⌈(N+1)/2⌉` replicas (including this one) durably hold
    /// the blob. First-to-cross: the wait ends at the threshold, not when
    /// every push finishes.
    pub async fn replicate_quorum(&self, blob_id: &str, compressed: Bytes) -> Result<()> {
        let needed = self.majority;
        let mut acks = 1usize; // The local store already holds it.
        if acks >= needed {
            self.push_background(blob_id, &compressed, &self.peers);
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(self.peers.len().max(1));
        for peer in self.peers.iter().copied() {
            let transport = Arc::clone(&self.transport);
            let id = blob_id.to_string();
            let body = compressed.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = transport.put_blob(peer, &id, body).await;
                if let Err(e) = &result {
                    warn!(peer = %peer, blob_id = %id, error = %e, "blob push failed");
                }
                let _ = tx.send(result.is_ok()).await;
            });
        }
        drop(tx);

        let mut responses = 0usize;
        while let Some(ok) = rx.recv().await {
            responses += 1;
            if ok {
                acks += 1;
                if acks >= needed {
                    debug!(blob_id, acks, "blob durability quorum reached");
                    // Remaining pushes continue detached.
                    return Ok(());
                }
            }
            let outstanding = self.peers.len() - responses;
            if acks + outstanding < needed {
                break;
            }
        }
        Err(Error::BlobQuorum { acks, needed })
    }

    /// Best-effort push to every peer, without waiting at all.
    pub fn push_background(&self, blob_id: &str, compressed: &Bytes, peers: &[NodeId]) {
        for peer in peers.iter().copied() {
            let transport = Arc::clone(&self.transport);
            let id = blob_id.to_string();
            let body = compressed.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.put_blob(peer, &id, body).await {
                    debug!(peer = %peer, blob_id = %id, error = %e, "background blob push failed");
                }
            });
        }
    }
}
