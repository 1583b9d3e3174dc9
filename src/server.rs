use crate::barrier::ReadGuarantee;
use crate::config::BarrierFailureMode;
use crate::model::{AuditEvent, ConfigEntry, Namespace, ValueType};
use crate::node::ConfmanNode;
use crate::raft::message::{AppendEntriesRequest, InstallSnapshotRequest, RequestVoteRequest};
use crate::transport::{
    APPEND_PATH, CLUSTER_TOKEN_HEADER, READ_INDEX_PATH, SNAPSHOT_PATH, VOTE_PATH,
};
use crate::Error;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

type AppState = Arc<ConfmanNode>;

/// RFC 7807 problem document; every error response carries a correlation
/// id in `instance`.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    kind: String,
    title: String,
    status: u16,
    detail: String,
    instance: String,
}

struct ApiError {
    status: StatusCode,
    problem: ProblemDetails,
    location: Option<String>,
    retry_after: bool,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, title: &str, detail: String) -> ApiError {
        ApiError {
            status,
            problem: ProblemDetails {
                kind: format!("https://confman.dev/problems/{kind}"),
                title: title.to_string(),
                status: status.as_u16(),
                detail,
                instance: format!("urn:uuid:{}", Uuid::new_v4()),
            },
            location: None,
            retry_after: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(&self.problem)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/problem+json"),
        );
        if let Some(location) = self.location {
            if let Ok(value) = header::HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
        }
        if self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

/// Translate core errors into the HTTP surface. `redirect_path` is set
/// for write routes so a follower can 307 to the leader.
fn map_error(node: &ConfmanNode, e: Error, redirect_path: Option<&str>) -> ApiError {
    match &e {
        Error::NotLeader {
            leader_hint: Some(leader),
        } => {
            if let (Some(addr), Some(path)) = (node.config().member_addr(*leader), redirect_path) {
                let mut err = ApiError::new(
                    StatusCode::TEMPORARY_REDIRECT,
                    "not-leader",
                    "Not the leader",
                    format!("this node is a follower; the leader is {leader}"),
                );
                err.location = Some(format!("http://{addr}{path}"));
                return err;
            }
            unavailable(&e)
        }
        Error::NotLeader { leader_hint: None } | Error::NoLeader => unavailable(&e),
        Error::QuorumUnavailable { .. } | Error::ProposerClosed | Error::BlobQuorum { .. } => {
            unavailable(&e)
        }
        Error::BarrierTimeout { .. } => {
            let mode = node.config().read_barrier.failure_mode;
            let status = if mode == BarrierFailureMode::Timeout {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let mut err = ApiError::new(
                status,
                "barrier-timeout",
                "Read barrier not established",
                e.to_string(),
            );
            err.retry_after = status == StatusCode::SERVICE_UNAVAILABLE;
            err
        }
        Error::KeyNotFound { .. } | Error::NamespaceNotFound(_) | Error::BlobUnavailable(_) => {
            ApiError::new(StatusCode::NOT_FOUND, "not-found", "Not found", e.to_string())
        }
        Error::ValueTooLarge { .. } => ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "value-too-large",
            "Value too large",
            e.to_string(),
        ),
        Error::InvalidBlobId(_) => ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid-blob-id",
            "Invalid blob id",
            e.to_string(),
        ),
        Error::Unauthorized => ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Unauthorized",
            e.to_string(),
        ),
        Error::BlobIntegrity { .. } => ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "blob-integrity",
            "Blob failed verification",
            e.to_string(),
        ),
        _ => {
            warn!(error = %e, "request failed");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Internal error",
                e.to_string(),
            )
        }
    }
}

fn unavailable(e: &Error) -> ApiError {
    let mut err = ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "unavailable",
        "Cluster unavailable",
        e.to_string(),
    );
    err.retry_after = true;
    err
}

// ----------------------------------------------------------------------
// Wire representations

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum ValueEncoding {
    #[default]
    Utf8,
    Hex,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    namespace: String,
    key: String,
    value: String,
    encoding: ValueEncoding,
    value_type: ValueType,
    blob_backed: bool,
    version: u64,
    updated_at: crate::model::Timestamp,
    updated_by: String,
}

fn encode_value(bytes: &[u8], value_type: ValueType) -> (String, ValueEncoding) {
    if value_type != ValueType::Binary {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return (text.to_string(), ValueEncoding::Utf8);
        }
    }
    (hex::encode(bytes), ValueEncoding::Hex)
}

fn config_response(entry: &ConfigEntry, value: &[u8]) -> ConfigResponse {
    let (value, encoding) = encode_value(value, entry.value_type);
    ConfigResponse {
        namespace: entry.namespace.clone(),
        key: entry.key.clone(),
        value,
        encoding,
        value_type: entry.value_type,
        blob_backed: entry.is_blob_backed(),
        version: entry.version,
        updated_at: entry.updated_at,
        updated_by: entry.updated_by.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct PutConfigRequest {
    value: String,
    #[serde(default)]
    value_type: ValueType,
    #[serde(default)]
    encoding: ValueEncoding,
}

#[derive(Debug, Deserialize)]
struct PutNamespaceRequest {
    #[serde(default)]
    description: String,
    #[serde(default)]
    owner: String,
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

fn author_from(headers: &HeaderMap) -> String {
    headers
        .get("x-confman-author")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

fn stale_marker(response: &mut Response, guarantee: ReadGuarantee) {
    if guarantee == ReadGuarantee::Stale {
        response.headers_mut().insert(
            "x-confman-stale",
            header::HeaderValue::from_static("true"),
        );
    }
}

// ----------------------------------------------------------------------
// Client-facing handlers

async fn health() -> &'static str {
    "ok"
}

async fn health_ready(State(node): State<AppState>) -> Response {
    if node.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no quorum").into_response()
    }
}

async fn cluster_status(State(node): State<AppState>) -> Response {
    Json(node.status()).into_response()
}

async fn get_config(
    State(node): State<AppState>,
    Path((ns, key)): Path<(String, String)>,
) -> Response {
    match node.get_config(&ns, &key).await {
        Ok((entry, value, guarantee)) => {
            let mut response = Json(config_response(&entry, &value)).into_response();
            stale_marker(&mut response, guarantee);
            response
        }
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn put_config(
    State(node): State<AppState>,
    Path((ns, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<PutConfigRequest>,
) -> Response {
    let value = match body.encoding {
        ValueEncoding::Utf8 => body.value.into_bytes(),
        ValueEncoding::Hex => match hex::decode(&body.value) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "bad-encoding",
                    "Undecodable value",
                    format!("hex decode: {e}"),
                )
                .into_response()
            }
        },
    };
    let author = author_from(&headers);
    let path = format!("/api/v1/namespaces/{ns}/config/{key}");
    match node
        .put_config(&ns, &key, value, body.value_type, &author)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => map_error(&node, e, Some(&path)).into_response(),
    }
}

async fn delete_config(
    State(node): State<AppState>,
    Path((ns, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let author = author_from(&headers);
    let path = format!("/api/v1/namespaces/{ns}/config/{key}");
    match node.delete_config(&ns, &key, &author).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => map_error(&node, e, Some(&path)).into_response(),
    }
}

async fn list_configs(State(node): State<AppState>, Path(ns): Path<String>) -> Response {
    match node.list_configs(&ns).await {
        Ok((entries, guarantee)) => {
            let body: Vec<ConfigResponse> = entries
                .iter()
                .map(|entry| {
                    let inline = entry.value.clone().unwrap_or_default();
                    config_response(entry, &inline)
                })
                .collect();
            let mut response = Json(body).into_response();
            stale_marker(&mut response, guarantee);
            response
        }
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn get_namespace(State(node): State<AppState>, Path(ns): Path<String>) -> Response {
    match node.get_namespace(&ns).await {
        Ok((namespace, guarantee)) => {
            let mut response = Json(namespace).into_response();
            stale_marker(&mut response, guarantee);
            response
        }
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn list_namespaces(State(node): State<AppState>) -> Response {
    match node.list_namespaces().await {
        Ok((namespaces, guarantee)) => {
            let mut response = Json::<Vec<Namespace>>(namespaces).into_response();
            stale_marker(&mut response, guarantee);
            response
        }
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn put_namespace(
    State(node): State<AppState>,
    Path(ns): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PutNamespaceRequest>,
) -> Response {
    let author = author_from(&headers);
    let path = format!("/api/v1/namespaces/{ns}");
    match node
        .put_namespace(&ns, &body.description, &body.owner, &author)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => map_error(&node, e, Some(&path)).into_response(),
    }
}

async fn delete_namespace(
    State(node): State<AppState>,
    Path(ns): Path<String>,
    headers: HeaderMap,
) -> Response {
    let author = author_from(&headers);
    let path = format!("/api/v1/namespaces/{ns}");
    match node.delete_namespace(&ns, &author).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => map_error(&node, e, Some(&path)).into_response(),
    }
}

async fn list_audit(
    State(node): State<AppState>,
    Path(ns): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match node.list_audit(&ns, limit).await {
        Ok((events, guarantee)) => {
            let mut response = Json::<Vec<AuditEvent>>(events).into_response();
            stale_marker(&mut response, guarantee);
            response
        }
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

// ----------------------------------------------------------------------
// Internal (inter-node) handlers

async fn require_cluster_token(
    State(node): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let presented = headers
        .get(CLUSTER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !node.verify_cluster_token(presented) {
        return map_error(&node, Error::Unauthorized, None).into_response();
    }
    next.run(request).await
}

async fn raft_vote(State(node): State<AppState>, body: Bytes) -> Response {
    let req: RequestVoteRequest = match bincode::deserialize(&body) {
        Ok(req) => req,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match node.raft().handle_request_vote(req).await {
        Ok(resp) => bincode_response(&resp),
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn raft_append(State(node): State<AppState>, body: Bytes) -> Response {
    let req: AppendEntriesRequest = match bincode::deserialize(&body) {
        Ok(req) => req,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match node.raft().handle_append_entries(req).await {
        Ok(resp) => bincode_response(&resp),
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn raft_snapshot(State(node): State<AppState>, body: Bytes) -> Response {
    let req: InstallSnapshotRequest = match bincode::deserialize(&body) {
        Ok(req) => req,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match node.raft().handle_install_snapshot(req).await {
        Ok(resp) => bincode_response(&resp),
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn raft_read_index(State(node): State<AppState>) -> Response {
    match node.handle_read_index().await {
        Ok(read_index) => bincode_response(&read_index),
        Err(Error::NotLeader { .. }) => StatusCode::CONFLICT.into_response(),
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn put_blob(
    State(node): State<AppState>,
    Path(blob_id): Path<String>,
    body: Bytes,
) -> Response {
    match node.handle_put_blob(&blob_id, body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

async fn get_blob(State(node): State<AppState>, Path(blob_id): Path<String>) -> Response {
    match node.handle_get_blob(&blob_id).await {
        Ok(bytes) => bytes.into_response(),
        Err(e) => map_error(&node, e, None).into_response(),
    }
}

fn bincode_response<T: serde::Serialize>(value: &T) -> Response {
    match bincode::serialize(value) {
        Ok(bytes) => bytes.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// ----------------------------------------------------------------------

/// The full routing table: client API plus the token-gated internal
/// endpoints. The internal side has no body limit, since AppendEntries
/// may bundle large entries and snapshots arrive whole.
pub fn router(node: Arc<ConfmanNode>) -> Router {
    let max_value = node.config().blob_store.max_blob_size_bytes as usize;

    let internal = Router::new()
        .route(VOTE_PATH, post(raft_vote))
        .route(APPEND_PATH, post(raft_append))
        .route(SNAPSHOT_PATH, post(raft_snapshot))
        .route(READ_INDEX_PATH, get(raft_read_index))
        .route("/internal/blobs/:id", put(put_blob).get(get_blob))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&node),
            require_cluster_token,
        ))
        .layer(DefaultBodyLimit::disable());

    let api = Router::new()
        .route("/api/v1/cluster/status", get(cluster_status))
        .route("/api/v1/namespaces", get(list_namespaces))
        .route(
            "/api/v1/namespaces/:ns",
            get(get_namespace)
                .put(put_namespace)
                .delete(delete_namespace),
        )
        .route("/api/v1/namespaces/:ns/config", get(list_configs))
        .route(
            "/api/v1/namespaces/:ns/config/:key",
            get(get_config).put(put_config).delete(delete_config),
        )
        .route("/api/v1/namespaces/:ns/audit", get(list_audit))
        .layer(DefaultBodyLimit::max(max_value.saturating_add(1024 * 1024)));

    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .merge(api)
        .merge(internal)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(node)
}
