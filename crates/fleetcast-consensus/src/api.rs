//! The cluster API server.
//!
//! One axum server per node, listening on the API address (raft port + 1)
//! behind basic auth. It serves two groups of endpoints:
//!
//! - the leader RPC consumed by the forwarder (`/v1/join`, `/v1/leave`,
//!   `/v1/process`, `/v1/iam/...`, `/v1/snapshot`, `/v1/transfer`), and
//! - the peer-discovery endpoints consumed by the node registry
//!   (`/v1/ping`, `/v1/config`, `/v1/metrics`, the file and channel
//!   listings).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine;
use fleetcast_core::process::ProcessId;
use fleetcast_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cluster::Cluster;
use crate::forwarder::{
    AddProcessRequest, ErrorPayload, IdentityRequest, JoinRequest, LeaveRequest,
    ProcessCommandRequest, ProcessMetadataRequest, SetNodeStateRequest, SetPoliciesRequest,
    UpdateProcessRequest,
};

/// Version of the peer config protocol. Peers refuse to connect to nodes
/// that answer with any other version.
pub const CONFIG_VERSION: u32 = 3;

/// One media endpoint advertisement in the peer config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaEndpoint {
    /// Whether the endpoint is served.
    pub enable: bool,
    /// Plain listen address (`host:port` or `:port`).
    pub address: String,
    /// TLS listen address, RTMP only.
    #[serde(default)]
    pub address_tls: String,
    /// Whether TLS is available, RTMP only.
    #[serde(default)]
    pub enable_tls: bool,
    /// Access token, if required.
    #[serde(default)]
    pub token: String,
    /// Encryption passphrase, SRT only.
    #[serde(default)]
    pub passphrase: String,
}

/// The `/v1/config` response peers parse at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    /// Config protocol version; must be [`CONFIG_VERSION`].
    pub version: u32,
    /// Node id.
    pub id: u64,
    /// Node name.
    pub name: String,
    /// RTMP advertisement.
    pub rtmp: MediaEndpoint,
    /// SRT advertisement.
    pub srt: MediaEndpoint,
}

/// The `/v1/metrics` response: the raw resource sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsResponse {
    /// Number of cores.
    pub cpu_ncpu: f64,
    /// Idle CPU in percent, 0-100.
    pub cpu_idle: f64,
    /// Total memory in bytes.
    pub mem_total: u64,
    /// Free memory in bytes.
    pub mem_free: u64,
}

/// Lists and serves the files of one local filesystem.
pub trait FileLister: Send + Sync {
    /// Returns all file names.
    fn list(&self) -> Vec<String>;
    /// Returns the content of one file.
    fn read(&self, path: &str) -> Option<bytes::Bytes>;
}

/// Lists the currently publishing channels of a media server.
pub trait ChannelLister: Send + Sync {
    /// Returns the channel names.
    fn channels(&self) -> Vec<String>;
}

/// Samples local CPU and memory.
pub trait ResourceSampler: Send + Sync {
    /// Returns the current sample.
    fn sample(&self) -> MetricsResponse;
}

/// A lister over nothing, for filesystems a node does not serve.
pub struct NullFileLister;

impl FileLister for NullFileLister {
    fn list(&self) -> Vec<String> {
        Vec::new()
    }

    fn read(&self, _path: &str) -> Option<bytes::Bytes> {
        None
    }
}

/// An in-memory file store. The media pipeline writes segments and
/// playlists into it; peers list and fetch them through the cluster API.
#[derive(Default)]
pub struct MemFileStore {
    files: dashmap::DashMap<String, bytes::Bytes>,
}

impl MemFileStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a file.
    pub fn put(&self, name: impl Into<String>, data: bytes::Bytes) {
        self.files.insert(name.into(), data);
    }

    /// Removes a file.
    pub fn remove(&self, name: &str) {
        self.files.remove(name);
    }
}

impl FileLister for MemFileStore {
    fn list(&self) -> Vec<String> {
        self.files.iter().map(|e| e.key().clone()).collect()
    }

    fn read(&self, path: &str) -> Option<bytes::Bytes> {
        self.files.get(path).map(|e| e.value().clone())
    }
}

/// A sampler reporting a single core and no memory, for tests and nodes
/// without a collector.
pub struct NullResourceSampler;

impl ResourceSampler for NullResourceSampler {
    fn sample(&self) -> MetricsResponse {
        MetricsResponse { cpu_ncpu: 1.0, cpu_idle: 100.0, mem_total: 0, mem_free: 0 }
    }
}

/// Everything the API server needs.
pub struct ApiOptions {
    /// The coordinator.
    pub cluster: Arc<Cluster>,
    /// Node name put into the config response.
    pub name: String,
    /// Basic auth username.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// RTMP advertisement.
    pub rtmp: MediaEndpoint,
    /// SRT advertisement.
    pub srt: MediaEndpoint,
    /// The in-memory filesystem.
    pub mem_fs: Arc<dyn FileLister>,
    /// The on-disk filesystem.
    pub disk_fs: Arc<dyn FileLister>,
    /// RTMP channel lister, when RTMP is served.
    pub rtmp_channels: Option<Arc<dyn ChannelLister>>,
    /// SRT channel lister, when SRT is served.
    pub srt_channels: Option<Arc<dyn ChannelLister>>,
    /// Local resource sampler.
    pub sampler: Arc<dyn ResourceSampler>,
}

struct ApiState {
    options: ApiOptions,
}

/// Starts the cluster API server on `addr`.
///
/// The returned sender shuts the server down when triggered.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve_api(
    addr: SocketAddr,
    options: ApiOptions,
) -> std::io::Result<tokio::sync::oneshot::Sender<()>> {
    let state = Arc::new(ApiState { options });

    let app = Router::new()
        // leader RPC
        .route("/v1/join", post(join))
        .route("/v1/leave", post(leave))
        .route("/v1/snapshot", get(snapshot))
        .route("/v1/transfer", put(transfer))
        .route("/v1/process", post(add_process))
        .route("/v1/process/:id", put(update_process).delete(remove_process))
        .route("/v1/process/:id/command", put(process_command))
        .route("/v1/process/:id/metadata/:key", put(process_metadata))
        .route("/v1/iam/user", post(add_identity))
        .route("/v1/iam/user/:name", put(update_identity).delete(remove_identity))
        .route("/v1/iam/user/:name/policy", put(set_policies))
        .route("/v1/node/:id/state", put(set_node_state))
        // peer discovery
        .route("/v1/ping", get(ping))
        .route("/v1/config", get(config))
        .route("/v1/metrics", get(metrics))
        .route("/v1/fs/mem", get(list_mem_fs))
        .route("/v1/fs/disk", get(list_disk_fs))
        .route("/v1/fs/mem/*path", get(get_mem_file))
        .route("/v1/fs/disk/*path", get(get_disk_file))
        .route("/v1/rtmp", get(list_rtmp))
        .route("/v1/srt", get(list_srt))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    info!(addr = %addr, "cluster API listening");

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "cluster API server error");
        }
    });

    Ok(shutdown_tx)
}

/// Error wrapper mapping the stable kinds onto HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let payload = ErrorPayload {
            kind: self.0.kind().as_str().to_string(),
            message: self.0.message.clone(),
        };
        (status, Json(payload)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn basic_auth(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
        .and_then(|v| String::from_utf8(v).ok())
        .is_some_and(|credentials| {
            let expected =
                format!("{}:{}", state.options.username, state.options.password);
            constant_time_eq(credentials.as_bytes(), expected.as_bytes())
        });

    if !authorized {
        return ApiError(Error::new(ErrorKind::Forbidden, "invalid credentials"))
            .into_response();
    }

    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ============================================================================
// Leader RPC
// ============================================================================

#[derive(Debug, Deserialize)]
struct OriginQuery {
    origin: Option<u64>,
    domain: Option<String>,
}

async fn join(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<StatusCode> {
    state
        .options
        .cluster
        .join(
            Some(req.origin),
            req.id,
            &req.raft_address,
            &req.api_address,
            &req.username,
            &req.password,
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn leave(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LeaveRequest>,
) -> ApiResult<StatusCode> {
    state.options.cluster.leave(Some(req.origin), Some(req.id)).await?;
    Ok(StatusCode::OK)
}

async fn snapshot(State(state): State<Arc<ApiState>>) -> ApiResult<Response> {
    let data = state.options.cluster.snapshot().await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

async fn transfer(State(state): State<Arc<ApiState>>) -> ApiResult<StatusCode> {
    state.options.cluster.trigger_election().await?;
    Ok(StatusCode::OK)
}

async fn add_process(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AddProcessRequest>,
) -> ApiResult<StatusCode> {
    state.options.cluster.add_process(Some(req.origin), req.config).await?;
    Ok(StatusCode::CREATED)
}

async fn update_process(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProcessRequest>,
) -> ApiResult<StatusCode> {
    let process_id = ProcessId::new(id, req.domain.clone());
    state.options.cluster.update_process(Some(req.origin), process_id, req.config).await?;
    Ok(StatusCode::OK)
}

async fn remove_process(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<OriginQuery>,
) -> ApiResult<StatusCode> {
    let process_id = ProcessId::new(id, query.domain.unwrap_or_default());
    state.options.cluster.remove_process(query.origin, process_id).await?;
    Ok(StatusCode::OK)
}

async fn process_command(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ProcessCommandRequest>,
) -> ApiResult<StatusCode> {
    let process_id = ProcessId::new(id, req.domain.clone());
    state
        .options
        .cluster
        .set_process_command(Some(req.origin), process_id, &req.command)
        .await?;
    Ok(StatusCode::OK)
}

async fn process_metadata(
    State(state): State<Arc<ApiState>>,
    Path((id, key)): Path<(String, String)>,
    Json(req): Json<ProcessMetadataRequest>,
) -> ApiResult<StatusCode> {
    let process_id = ProcessId::new(id, req.domain.clone());
    state
        .options
        .cluster
        .set_process_metadata(Some(req.origin), process_id, key, req.value)
        .await?;
    Ok(StatusCode::OK)
}

async fn add_identity(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<IdentityRequest>,
) -> ApiResult<StatusCode> {
    state.options.cluster.add_identity(Some(req.origin), req.identity).await?;
    Ok(StatusCode::CREATED)
}

async fn update_identity(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(req): Json<IdentityRequest>,
) -> ApiResult<StatusCode> {
    state.options.cluster.update_identity(Some(req.origin), name, req.identity).await?;
    Ok(StatusCode::OK)
}

async fn remove_identity(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Query(query): Query<OriginQuery>,
) -> ApiResult<StatusCode> {
    state.options.cluster.remove_identity(query.origin, name).await?;
    Ok(StatusCode::OK)
}

async fn set_policies(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(req): Json<SetPoliciesRequest>,
) -> ApiResult<StatusCode> {
    state.options.cluster.set_policies(Some(req.origin), name, req.policies).await?;
    Ok(StatusCode::OK)
}

async fn set_node_state(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
    Json(req): Json<SetNodeStateRequest>,
) -> ApiResult<StatusCode> {
    state.options.cluster.set_node_state(Some(req.origin), id, &req.state).await?;
    Ok(StatusCode::OK)
}

// ============================================================================
// Peer discovery
// ============================================================================

async fn ping() -> &'static str {
    "pong"
}

async fn config(State(state): State<Arc<ApiState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        version: CONFIG_VERSION,
        id: state.options.cluster.id(),
        name: state.options.name.clone(),
        rtmp: state.options.rtmp.clone(),
        srt: state.options.srt.clone(),
    })
}

async fn metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsResponse> {
    Json(state.options.sampler.sample())
}

async fn list_mem_fs(State(state): State<Arc<ApiState>>) -> Json<Vec<String>> {
    Json(state.options.mem_fs.list())
}

async fn list_disk_fs(State(state): State<Arc<ApiState>>) -> Json<Vec<String>> {
    Json(state.options.disk_fs.list())
}

async fn get_mem_file(
    State(state): State<Arc<ApiState>>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    serve_file(state.options.mem_fs.as_ref(), &path)
}

async fn get_disk_file(
    State(state): State<Arc<ApiState>>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    serve_file(state.options.disk_fs.as_ref(), &path)
}

fn serve_file(fs: &dyn FileLister, path: &str) -> ApiResult<Response> {
    // Listings carry absolute names; path extraction strips the slash.
    let name = format!("/{path}");
    match fs.read(&name) {
        Some(data) => {
            Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
        }
        None => Err(ApiError(Error::not_found(format!("file '{name}'")))),
    }
}

async fn list_rtmp(State(state): State<Arc<ApiState>>) -> Json<Vec<String>> {
    Json(state.options.rtmp_channels.as_ref().map(|l| l.channels()).unwrap_or_default())
}

async fn list_srt(State(state): State<Arc<ApiState>>) -> Json<Vec<String>> {
    Json(state.options.srt_channels.as_ref().map(|l| l.channels()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"user:pass", b"user:pass"));
        assert!(!constant_time_eq(b"user:pass", b"user:wrong"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn test_config_response_serialization() {
        let response = ConfigResponse {
            version: CONFIG_VERSION,
            id: 1,
            name: "node-1".to_string(),
            rtmp: MediaEndpoint { enable: true, address: ":1935".to_string(), ..Default::default() },
            srt: MediaEndpoint::default(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["rtmp"]["enable"], true);
    }
}
