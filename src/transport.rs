use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::{Error, LogIndex, NodeId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

/// Header carrying the shared cluster secret on every internal request.
pub const CLUSTER_TOKEN_HEADER: &str = "x-confman-cluster-token";

pub const VOTE_PATH: &str = "/internal/raft/vote";
pub const APPEND_PATH: &str = "/internal/raft/append";
pub const SNAPSHOT_PATH: &str = "/internal/raft/snapshot";
pub const READ_INDEX_PATH: &str = "/internal/raft/read-index";

/// Inter-node communication seam. The production implementation speaks
/// HTTP; tests swap in an in-process mesh with partition control.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn request_vote(&self, to: NodeId, req: RequestVoteRequest)
        -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        to: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Ask a peer (the leader) for a quorum-confirmed read index.
    async fn read_index(&self, to: NodeId) -> Result<LogIndex>;

    /// Hand a compressed blob to a peer; returns once the peer has it
    /// durably on disk.
    async fn put_blob(&self, to: NodeId, blob_id: &str, compressed: Bytes) -> Result<()>;

    /// Fetch a compressed blob from a peer.
    async fn fetch_blob(&self, to: NodeId, blob_id: &str) -> Result<Bytes>;
}

/// HTTP transport between cluster members. Consensus payloads travel as
/// bincode bodies; blob payloads as raw compressed bytes. Every request
/// carries the cluster token.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    members: Vec<String>,
    token: String,
}

impl HttpTransport {
    pub fn new(members: Vec<String>, token: String, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(2)))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(HttpTransport {
            client,
            members,
            token,
        })
    }

    fn url(&self, to: NodeId, path: &str) -> Result<String> {
        let addr = self
            .members
            .get(to.0 as usize)
            .ok_or_else(|| Error::Transport {
                peer: to,
                reason: "unknown cluster member".into(),
            })?;
        Ok(format!("http://{addr}{path}"))
    }

    fn transport_err(to: NodeId, e: impl std::fmt::Display) -> Error {
        Error::Transport {
            peer: to,
            reason: e.to_string(),
        }
    }

    async fn post_bincode<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        to: NodeId,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let body = bincode::serialize(req)?;
        let response = self
            .client
            .post(self.url(to, path)?)
            .header(CLUSTER_TOKEN_HEADER, &self.token)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::transport_err(to, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::transport_err(to, format!("{path} returned {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::transport_err(to, e))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.post_bincode(to, VOTE_PATH, &req).await
    }

    async fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post_bincode(to, APPEND_PATH, &req).await
    }

    async fn install_snapshot(
        &self,
        to: NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post_bincode(to, SNAPSHOT_PATH, &req).await
    }

    async fn read_index(&self, to: NodeId) -> Result<LogIndex> {
        let response = self
            .client
            .get(self.url(to, READ_INDEX_PATH)?)
            .header(CLUSTER_TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| Self::transport_err(to, e))?;
        match response.status().as_u16() {
            200 => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Self::transport_err(to, e))?;
                Ok(bincode::deserialize(&bytes)?)
            }
            409 => Err(Error::NotLeader { leader_hint: None }),
            503 => Err(Error::QuorumUnavailable {
                reason: format!("peer {to} has no quorum"),
            }),
            other => Err(Self::transport_err(to, format!("read-index returned {other}"))),
        }
    }

    async fn put_blob(&self, to: NodeId, blob_id: &str, compressed: Bytes) -> Result<()> {
        let url = self.url(to, &format!("/internal/blobs/{blob_id}"))?;
        // One quick retry smooths over connection churn; anything longer
        // is the caller's problem.
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let result = self
                .client
                .put(&url)
                .header(CLUSTER_TOKEN_HEADER, &self.token)
                .body(compressed.clone())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_err = Some(Self::transport_err(
                        to,
                        format!("blob put returned {}", response.status()),
                    ));
                    break;
                }
                Err(e) => {
                    debug!(peer = %to, error = %e, attempt, "blob put attempt failed");
                    last_err = Some(Self::transport_err(to, e));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Self::transport_err(to, "blob put failed")))
    }

    async fn fetch_blob(&self, to: NodeId, blob_id: &str) -> Result<Bytes> {
        let url = self.url(to, &format!("/internal/blobs/{blob_id}"))?;
        let response = self
            .client
            .get(&url)
            .header(CLUSTER_TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| Self::transport_err(to, e))?;
        match response.status().as_u16() {
            200 => response.bytes().await.map_err(|e| Self::transport_err(to, e)),
            404 => Err(Error::BlobUnavailable(blob_id.to_string())),
            other => Err(Self::transport_err(to, format!("blob get returned {other}"))),
        }
    }
}
