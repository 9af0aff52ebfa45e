//! HTTP surface of a combainer node
//!
//! One axum router serves:
//! - raft RPCs between nodes (`/raft/append`, `/raft/snapshot`, `/raft/vote`)
//! - the observer REST endpoint (`/REST/`, `/REST/{config}`)
//! - health, raft metrics, gossip membership and the assignment distribution
//!
//! Raft bodies are postcard (`application/octet-stream`) or JSON, picked
//! from the `Content-Type` header. When a cluster token is configured the
//! raft, membership and assignment routes require `Authorization: Bearer`.

use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use combainer_cluster::{ClusterContext, NodeState, StatInfo, TypeConfig};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
const CONTENT_TYPE_JSON: &str = "application/json";

/// Snapshots carry the whole assignment map
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

fn deserialize_request<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(CONTENT_TYPE_JSON);

    if content_type.contains("octet-stream") {
        postcard::from_bytes(body).map_err(|e| format!("postcard deserialize error: {}", e))
    } else {
        serde_json::from_slice(body).map_err(|e| format!("json deserialize error: {}", e))
    }
}

/// Encode in the format the caller asked for (Accept, then Content-Type)
fn serialize_response<T: Serialize>(
    headers: &HeaderMap,
    data: &T,
) -> Result<(Bytes, &'static str), String> {
    let accept = headers
        .get(header::ACCEPT)
        .or_else(|| headers.get(header::CONTENT_TYPE))
        .and_then(|v| v.to_str().ok())
        .unwrap_or(CONTENT_TYPE_JSON);

    if accept.contains("octet-stream") {
        let bytes =
            postcard::to_allocvec(data).map_err(|e| format!("postcard serialize error: {}", e))?;
        Ok((Bytes::from(bytes), CONTENT_TYPE_BINARY))
    } else {
        let bytes = serde_json::to_vec(data).map_err(|e| format!("json serialize error: {}", e))?;
        Ok((Bytes::from(bytes), CONTENT_TYPE_JSON))
    }
}

// ============================================================================
// API Types
// ============================================================================

/// State shared by every handler
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ClusterContext>,
    pub cluster_auth_token: Option<Arc<String>>,
}

impl ApiState {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        let cluster_auth_token = ctx.config().cluster_auth_token.clone().map(Arc::new);
        Self {
            ctx,
            cluster_auth_token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node: String,
    pub node_id: u64,
    pub is_leader: bool,
    pub leader_id: Option<u64>,
    pub alive_members: usize,
    pub running_sessions: usize,
}

/// Body of `GET /REST/`
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObserverResponse {
    pub tasks: usize,
    pub clients: BTreeMap<String, StatInfo>,
}

#[derive(Debug, Serialize)]
pub struct MemberView {
    pub id: String,
    pub gossip_addr: SocketAddr,
    pub raft_addr: String,
    pub state: NodeState,
}

#[derive(Debug, Serialize)]
pub struct MembershipResponse {
    pub members: Vec<MemberView>,
    /// Raft voters: id -> raft address
    pub voters: BTreeMap<u64, String>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentsResponse {
    pub leader_id: Option<u64>,
    pub total: usize,
    pub hosts: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: status.as_u16(),
        }),
    )
        .into_response()
}

// ============================================================================
// Authentication Middleware
// ============================================================================

/// Checks `Authorization: Bearer <token>` in constant time
pub async fn cluster_auth_middleware(
    expected_token: Arc<String>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    use subtle::ConstantTimeEq;

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(provided) => {
            let expected = expected_token.as_bytes();
            let provided = provided.as_bytes();
            if expected.len() == provided.len() && bool::from(expected.ct_eq(provided)) {
                next.run(req).await
            } else {
                (StatusCode::UNAUTHORIZED, "Invalid cluster token").into_response()
            }
        }
        None => (
            StatusCode::UNAUTHORIZED,
            "Missing Authorization: Bearer <token>",
        )
            .into_response(),
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: ApiState) -> Router {
    let public = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(prometheus_metrics_handler))
        .route("/REST/", get(observer_handler))
        .route("/REST/:config", get(observer_config_handler));

    let mut protected = Router::new()
        .route("/raft/append", post(append_entries_handler))
        .route("/raft/snapshot", post(install_snapshot_handler))
        .route("/raft/vote", post(vote_handler))
        .route("/membership", get(membership_handler))
        .route("/assignments", get(assignments_handler));

    if let Some(token) = state.cluster_auth_token.clone() {
        protected = protected.layer(axum::middleware::from_fn(move |req, next| {
            cluster_auth_middleware(token.clone(), req, next)
        }));
    }

    public
        .merge(protected)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve the router on `addr` until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind HTTP API on {}", addr))?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP API server failed")
}

// ============================================================================
// Observer Handlers
// ============================================================================

async fn observer_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(ObserverResponse {
        tasks: state.ctx.running_sessions(),
        clients: state.ctx.observer().get_clients_stats(),
    })
}

async fn observer_config_handler(
    State(state): State<ApiState>,
    Path(config): Path<String>,
) -> Response {
    match state.ctx.observer().get_client_stats(&config) {
        Some(stats) => Json(stats).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no client for config {}", config),
        ),
    }
}

// ============================================================================
// Management Handlers
// ============================================================================

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let raft = state.ctx.raft();
    let leader_id = raft.leader();
    let (status, code) = match leader_id {
        Some(_) => ("healthy", StatusCode::OK),
        None => ("degraded", StatusCode::SERVICE_UNAVAILABLE),
    };

    let response = HealthResponse {
        status: status.to_string(),
        node: raft.name().to_string(),
        node_id: raft.node_id(),
        is_leader: raft.is_leader(),
        leader_id,
        alive_members: state.ctx.membership().alive_count(),
        running_sessions: state.ctx.running_sessions(),
    };
    (code, Json(response))
}

async fn prometheus_metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let raft = state.ctx.raft();
    let m = raft.metrics();
    let membership = m.membership_config.membership();
    let store = state.ctx.store();

    let gauges: [(&str, &str, u64); 8] = [
        ("raft_is_leader", "Whether this node is the raft leader", u64::from(raft.is_leader())),
        ("raft_current_term", "Current raft term", m.current_term),
        ("raft_last_log_index", "Index of the last log entry", m.last_log_index.unwrap_or(0)),
        (
            "raft_applied_index",
            "Index of the last applied entry",
            m.last_applied.map(|l| l.index).unwrap_or(0),
        ),
        ("raft_cluster_voters", "Raft voters", membership.voter_ids().count() as u64),
        (
            "cluster_alive_members",
            "Alive gossip members",
            state.ctx.membership().alive_count() as u64,
        ),
        ("assigned_configs", "Configs assigned cluster-wide", store.total_assigned() as u64),
        (
            "running_sessions",
            "Session loops running on this node",
            state.ctx.running_sessions() as u64,
        ),
    ];

    let mut output = String::new();
    for (name, help, value) in gauges {
        output.push_str(&format!("# HELP combainer_{} {}\n", name, help));
        output.push_str(&format!("# TYPE combainer_{} gauge\n", name));
        output.push_str(&format!("combainer_{} {}\n", name, value));
    }
    output.push_str("# HELP combainer_info Build information\n");
    output.push_str("# TYPE combainer_info gauge\n");
    output.push_str(&format!(
        "combainer_info{{version=\"{}\",node=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION"),
        raft.name()
    ));

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

async fn membership_handler(State(state): State<ApiState>) -> impl IntoResponse {
    use combainer_cluster::VoterControl;

    let mut members: Vec<MemberView> = state
        .ctx
        .membership()
        .members()
        .into_iter()
        .map(|n| MemberView {
            id: n.info.id,
            gossip_addr: n.info.gossip_addr,
            raft_addr: n.info.raft_addr,
            state: n.state,
        })
        .collect();
    members.sort_by(|a, b| a.id.cmp(&b.id));

    Json(MembershipResponse {
        members,
        voters: state.ctx.raft().voters(),
    })
}

async fn assignments_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.ctx.store();
    let hosts = store
        .dump()
        .into_iter()
        .map(|(host, configs)| (host, configs.into_iter().collect()))
        .collect();

    Json(AssignmentsResponse {
        leader_id: state.ctx.raft().leader(),
        total: store.total_assigned(),
        hosts,
    })
}

// ============================================================================
// Raft RPC Handlers
// ============================================================================

/// Decode, hand to raft, encode the reply in the caller's format
async fn raft_rpc<Req, Resp, F, Fut>(
    name: &'static str,
    headers: HeaderMap,
    body: Bytes,
    handle: F,
) -> Response
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = combainer_cluster::Result<Resp>>,
{
    let req: Req = match deserialize_request(&headers, &body) {
        Ok(r) => r,
        Err(e) => {
            error!(rpc = name, error = %e, "Failed to decode raft RPC");
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };

    match handle(req).await {
        Ok(resp) => match serialize_response(&headers, &resp) {
            Ok((bytes, content_type)) => {
                (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
            }
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        Err(e) => {
            error!(rpc = name, error = %e, "Raft RPC failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn append_entries_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    raft_rpc(
        "append",
        headers,
        body,
        |req: AppendEntriesRequest<TypeConfig>| async move {
            debug!(
                leader = req.vote.leader_id().node_id,
                term = req.vote.leader_id().term,
                entries = req.entries.len(),
                "AppendEntries RPC"
            );
            state.ctx.raft().handle_append_entries(req).await
        },
    )
    .await
}

async fn install_snapshot_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    raft_rpc(
        "snapshot",
        headers,
        body,
        |req: InstallSnapshotRequest<TypeConfig>| async move {
            debug!(
                leader = req.vote.leader_id().node_id,
                size = req.data.len(),
                "InstallSnapshot RPC"
            );
            state.ctx.raft().handle_install_snapshot(req).await
        },
    )
    .await
}

async fn vote_handler(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    raft_rpc("vote", headers, body, |req: VoteRequest<u64>| async move {
        debug!(candidate = req.vote.leader_id().node_id, "Vote RPC");
        state.ctx.raft().handle_vote(req).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use combainer_cluster::{ClientStats, ClusterConfig, FilesystemRepository};
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    const COMBAINE_YAML: &str = r#"
Combainer:
  Main:
    ParallelParsings: 2
    MINIMUM_PERIOD: 20
cloud_config:
  HostFetcher:
    type: predefine
    Clusters:
      front: {dc1: [front-01]}
"#;

    struct Fixture {
        _repo: TempDir,
        _data: TempDir,
        ctx: Arc<ClusterContext>,
    }

    async fn fixture(token: Option<&str>) -> Fixture {
        let repo_dir = TempDir::new().unwrap();
        std::fs::write(repo_dir.path().join("combaine.yaml"), COMBAINE_YAML).unwrap();
        std::fs::create_dir(repo_dir.path().join("parsing")).unwrap();
        std::fs::create_dir(repo_dir.path().join("aggregate")).unwrap();
        let repo = Arc::new(FilesystemRepository::new(repo_dir.path()).unwrap());

        let data_dir = TempDir::new().unwrap();
        let mut builder = ClusterConfig::builder()
            .node_id("api-test")
            .data_dir(data_dir.path())
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .raft_addr("127.0.0.1:0".parse().unwrap());
        if let Some(token) = token {
            builder = builder.cluster_auth_token(token);
        }
        let ctx = ClusterContext::new(builder.build(), repo).await.unwrap();

        Fixture {
            _repo: repo_dir,
            _data: data_dir,
            ctx,
        }
    }

    async fn get(router: Router, uri: &str, auth: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = auth {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let resp = router
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_observer_lists_registered_clients() {
        let f = fixture(None).await;
        let stats = Arc::new(ClientStats::new());
        stats.add_success_parsing();
        stats.add_failed_aggregate();
        f.ctx.observer().register_client("client-1", stats, "nginx");

        let router = create_router(ApiState::new(f.ctx.clone()));
        let (status, body) = get(router, "/REST/", None).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["Tasks"], 0);
        assert_eq!(json["Clients"]["nginx"]["ParsingSuccess"], 1);
        assert_eq!(json["Clients"]["nginx"]["AggregateFailed"], 1);
    }

    #[tokio::test]
    async fn test_observer_single_config() {
        let f = fixture(None).await;
        f.ctx
            .observer()
            .register_client("client-1", Arc::new(ClientStats::new()), "nginx");

        let router = create_router(ApiState::new(f.ctx.clone()));
        let (status, body) = get(router.clone(), "/REST/nginx", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ParsingTotal"], 0);

        let (status, _) = get(router, "/REST/absent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_without_leader_is_degraded() {
        let f = fixture(None).await;
        let router = create_router(ApiState::new(f.ctx.clone()));

        let (status, body) = get(router, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["node"], "api-test");
    }

    #[tokio::test]
    async fn test_metrics_are_prometheus_text() {
        let f = fixture(None).await;
        let router = create_router(ApiState::new(f.ctx.clone()));

        let (status, body) = get(router, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("combainer_raft_is_leader 0"));
        assert!(text.contains("combainer_assigned_configs 0"));
    }

    #[tokio::test]
    async fn test_cluster_routes_require_token() {
        let f = fixture(Some("s3cret")).await;
        let router = create_router(ApiState::new(f.ctx.clone()));

        let (status, _) = get(router.clone(), "/membership", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(router.clone(), "/membership", Some("wrong!")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = get(router.clone(), "/membership", Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["members"][0]["id"], "api-test");

        // the observer stays public
        let (status, _) = get(router, "/REST/", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_assignments_dump() {
        let f = fixture(None).await;
        f.ctx
            .store()
            .apply(combainer_cluster::AssignmentCommand::assign("other", "nginx"));

        let router = create_router(ApiState::new(f.ctx.clone()));
        let (status, body) = get(router, "/assignments", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["hosts"]["other"][0], "nginx");
    }

    #[tokio::test]
    async fn test_malformed_raft_body_is_rejected() {
        let f = fixture(None).await;
        let router = create_router(ApiState::new(f.ctx.clone()));

        let req = Request::builder()
            .method("POST")
            .uri("/raft/vote")
            .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(Body::from("{not json"))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
