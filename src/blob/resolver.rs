use super::store::BlobStore;
use super::validate_blob_id;
use crate::transport::Transport;
use crate::{Error, NodeId, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Read-side blob resolution: local first, then any live peer. A per-id
/// singleflight gate keeps a thundering herd of readers behind a single
/// fetch.
#[derive(Debug)]
pub struct BlobResolver {
    store: Arc<BlobStore>,
    transport: Arc<dyn Transport>,
    peers: Vec<NodeId>,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl BlobResolver {
    pub fn new(store: Arc<BlobStore>, transport: Arc<dyn Transport>, peers: Vec<NodeId>) -> Self {
        BlobResolver {
            store,
            transport,
            peers,
            gates: DashMap::new(),
        }
    }

    pub async fn resolve(&self, blob_id: &str) -> Result<Vec<u8>> {
        validate_blob_id(blob_id)?;
        match self.read_local(blob_id).await {
            Ok(value) => return Ok(value),
            Err(Error::BlobUnavailable(_)) => {}
            Err(Error::BlobIntegrity { .. }) => {
                // Corrupt copy was discarded; fall through to refetch.
                warn!(blob_id, "refetching blob after local integrity failure");
            }
            Err(e) => return Err(e),
        }

        let gate = self
            .gates
            .entry(blob_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Whoever held the gate before us may have fetched it already.
        match self.read_local(blob_id).await {
            Ok(value) => {
                self.gates.remove(blob_id);
                return Ok(value);
            }
            Err(Error::BlobUnavailable(_) | Error::BlobIntegrity { .. }) => {}
            Err(e) => return Err(e),
        }

        let result = self.fetch_from_peers(blob_id).await;
        self.gates.remove(blob_id);
        result
    }

    async fn fetch_from_peers(&self, blob_id: &str) -> Result<Vec<u8>> {
        for peer in self.peers.iter().copied() {
            match self.transport.fetch_blob(peer, blob_id).await {
                Ok(compressed) => {
                    let store = Arc::clone(&self.store);
                    let id = blob_id.to_string();
                    let stored = tokio::task::spawn_blocking(move || {
                        store.put_compressed(&id, &compressed)
                    })
                    .await
                    .map_err(|e| Error::Durability {
                        reason: format!("blob write task: {e}"),
                    })?;
                    match stored {
                        Ok(()) => {
                            info!(blob_id, peer = %peer, "blob repaired from peer");
                            return self.read_local(blob_id).await;
                        }
                        Err(e) => {
                            // Hash mismatch from this peer; try another.
                            warn!(peer = %peer, blob_id, error = %e, "peer served a bad blob");
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, blob_id, error = %e, "blob fetch failed");
                }
            }
        }
        Err(Error::BlobUnavailable(blob_id.to_string()))
    }

    async fn read_local(&self, blob_id: &str) -> Result<Vec<u8>> {
        let store = Arc::clone(&self.store);
        let id = blob_id.to_string();
        tokio::task::spawn_blocking(move || store.read_value(&id))
            .await
            .map_err(|e| Error::Durability {
                reason: format!("blob read task: {e}"),
            })?
    }
}
