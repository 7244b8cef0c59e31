//! HTTP management surface.
//!
//! Every dashboard route sits behind the shared bearer token; `/health` and
//! the worker readiness ping do not. The CLI is a thin front-end over these
//! routes, so they carry the whole operator surface.

use crate::ControlPlane;
use axum::{
    Json, Router,
    body::Bytes,
    extract::ws::WebSocketUpgrade,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use molt_approval::ApprovalManager;
use molt_fleet::{AgentRecord, FleetManager};
use molt_manifest::{Manifest, ParseOutcome};
use molt_proto::{Goal, KnowledgeDoc, PlaneMessage};
use molt_provision::{ProvisionError, Provisioner, bootstrap};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub fleet: Arc<FleetManager>,
    pub approvals: Arc<ApprovalManager>,
    pub provisioner: Arc<Provisioner>,
}

impl AppState {
    pub fn new(
        control: Arc<ControlPlane>,
        fleet: Arc<FleetManager>,
        approvals: Arc<ApprovalManager>,
        provisioner: Arc<Provisioner>,
    ) -> Self {
        control.wire_approvals();
        Self {
            control,
            fleet,
            approvals,
            provisioner,
        }
    }
}

// ─── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/moltagent/dashboard/overview", get(overview))
        .route("/moltagent/dashboard/agents", get(list_agents).post(create_agent))
        .route(
            "/moltagent/dashboard/agents/{id}",
            get(get_agent).delete(delete_agent),
        )
        .route("/moltagent/dashboard/agents/{id}/actions", get(agent_actions))
        .route("/moltagent/dashboard/agents/{id}/message", post(relay_message))
        .route("/moltagent/dashboard/agents/{id}/goals", post(relay_goals))
        .route("/moltagent/dashboard/agents/{id}/knowledge", post(relay_knowledge))
        .route("/moltagent/dashboard/agents/{id}/restart", post(relay_restart))
        .route("/moltagent/dashboard/approvals", get(pending_approvals))
        .route("/moltagent/dashboard/approvals/history", get(approval_history))
        .route("/moltagent/dashboard/approvals/{id}/respond", post(respond_approval))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/moltagent/health", get(health))
        .route("/moltagent/ready", post(ready))
        .route("/moltagent/ws", get(ws_upgrade))
        .merge(protected)
        .with_state(state)
}

/// Serve the control plane on an already-bound listener until `shutdown`
/// resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

// ─── Auth ─────────────────────────────────────────────────────────────────────

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if bearer_token(request.headers()).is_some_and(|t| state.control.token_matches(t)) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

// ─── WebSocket admission ──────────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !state.control.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let presented = bearer_token(&headers)
        .map(str::to_string)
        .or_else(|| params.get("token").cloned());
    if !presented
        .as_deref()
        .is_some_and(|t| state.control.token_matches(t))
    {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    let Some(agent_id) = params
        .get("agentId")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "agentId is required").into_response();
    };

    let control = Arc::clone(&state.control);
    ws.on_upgrade(move |socket| control.handle_connection(socket, agent_id, addr.to_string()))
}

// ─── Liveness & readiness ─────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn ready(body: Option<Json<Value>>) -> Json<Value> {
    let agent_id = body
        .as_ref()
        .and_then(|b| b.get("agentId"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    info!(agent_id, "worker bootstrap readiness ping");
    Json(json!({"ok": true}))
}

// ─── Dashboard: fleet ─────────────────────────────────────────────────────────

async fn overview(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "fleet": state.fleet.summary().await,
        "approvals": state.approvals.summary().await,
        "onlineAgents": state.control.online_agents().await,
    }))
}

fn record_summary(record: &AgentRecord) -> Value {
    json!({
        "agentId": record.manifest.identity.id,
        "name": record.manifest.identity.name,
        "connection": record.connection,
        "state": record.last_status.as_ref().map(|s| s.state),
        "instanceStatus": record.instance.as_ref().map(|i| i.status),
        "deployedAt": record.deployed_at,
        "lastHeartbeat": record.last_heartbeat,
        "uptimeSec": record.uptime_sec,
        "totalActions": record.total_actions,
        "totalSpendUsd": record.total_spend_usd,
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Value> {
    let agents: Vec<Value> = state.fleet.list().await.iter().map(record_summary).collect();
    Json(json!({"agents": agents}))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.fleet.get(&id).await {
        Some(record) => {
            let mut value = serde_json::to_value(&record).unwrap_or(Value::Null);
            // Tokens and channel credentials never leave the server.
            value["manifest"] = record.manifest.redacted();
            Json(value).into_response()
        }
        None => not_found("agent"),
    }
}

async fn create_agent(State(state): State<AppState>, body: Bytes) -> Response {
    let manifest = match Manifest::safe_parse(&body) {
        ParseOutcome::Valid(manifest) => *manifest,
        ParseOutcome::Invalid(issues) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "validation failed", "issues": issues})),
            )
                .into_response();
        }
    };

    let script = bootstrap::generate(&manifest);
    let instance = match state.provisioner.provision(&manifest, &script).await {
        Ok(instance) => instance,
        Err(e @ ProvisionError::UnknownProvider { .. }) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "provisioning failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let agent_id = manifest.identity.id.clone();
    state
        .fleet
        .register_agent(manifest, Some(instance.clone()))
        .await;
    info!(agent_id, "agent provisioned and registered");

    (
        StatusCode::CREATED,
        Json(json!({"agentId": agent_id, "instance": instance})),
    )
        .into_response()
}

async fn delete_agent(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let shutdown_sent = state.control.send_to_agent(&id, &PlaneMessage::Shutdown).await;

    let instance_destroyed = match state.provisioner.destroy(&id).await {
        Ok(()) => true,
        Err(ProvisionError::UnknownAgent(_)) => false,
        Err(e) => {
            warn!(agent_id = %id, error = %e, "instance teardown failed");
            false
        }
    };

    let removed = state.fleet.remove_agent(&id).await;
    info!(agent_id = %id, shutdown_sent, instance_destroyed, removed, "agent deleted");
    Json(json!({
        "removed": removed,
        "shutdownSent": shutdown_sent,
        "instanceDestroyed": instance_destroyed,
    }))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn agent_actions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    let Some(record) = state.fleet.get(&id).await else {
        return not_found("agent");
    };
    let actions = state
        .fleet
        .recent_actions(&id, page.limit.unwrap_or(50), page.offset.unwrap_or(0))
        .await;
    Json(json!({
        "agentId": id,
        "totalActions": record.total_actions,
        "actions": actions,
    }))
    .into_response()
}

// ─── Dashboard: command relays ────────────────────────────────────────────────

async fn relay(state: &AppState, agent_id: &str, message: PlaneMessage) -> Response {
    if state.control.send_to_agent(agent_id, &message).await {
        Json(json!({"delivered": true})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "agent is not connected", "agentOnline": false})),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    content: String,
    channel: Option<String>,
}

async fn relay_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Response {
    if body.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "content must not be empty"})),
        )
            .into_response();
    }
    relay(
        &state,
        &id,
        PlaneMessage::SendMessage {
            content: body.content,
            channel: body.channel,
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct GoalsBody {
    goals: Vec<Goal>,
}

async fn relay_goals(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<GoalsBody>,
) -> Response {
    relay(&state, &id, PlaneMessage::UpdateGoals { goals: body.goals }).await
}

#[derive(Debug, Deserialize)]
struct KnowledgeBody {
    documents: Vec<KnowledgeDoc>,
}

async fn relay_knowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<KnowledgeBody>,
) -> Response {
    relay(
        &state,
        &id,
        PlaneMessage::InjectKnowledge {
            documents: body.documents,
        },
    )
    .await
}

async fn relay_restart(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    relay(&state, &id, PlaneMessage::Restart).await
}

// ─── Dashboard: approvals ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApprovalsQuery {
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
}

async fn pending_approvals(
    State(state): State<AppState>,
    Query(query): Query<ApprovalsQuery>,
) -> Json<Value> {
    let pending = state.approvals.pending(query.agent_id.as_deref()).await;
    Json(json!({"approvals": pending}))
}

async fn approval_history(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<Value> {
    let history = state
        .approvals
        .history(page.limit.unwrap_or(50), page.offset.unwrap_or(0))
        .await;
    Json(json!({"history": history}))
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    approved: bool,
    reason: Option<String>,
    #[serde(rename = "respondedBy")]
    responded_by: Option<String>,
}

async fn respond_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> Response {
    // The worker-side relay rides on the approval manager's resolution
    // callback, which covers expiry-driven denials through the same path.
    match state
        .approvals
        .resolve(&id, body.approved, body.responded_by, body.reason)
        .await
    {
        Some(resolved) => Json(serde_json::to_value(&resolved).unwrap_or(Value::Null)).into_response(),
        None => not_found("approval"),
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path) -> AppState {
        let fleet = Arc::new(FleetManager::load(dir.join("fleet.json")));
        let approvals = ApprovalManager::new();
        let control = ControlPlane::new("T", Arc::clone(&fleet), Arc::clone(&approvals));
        let registry = Arc::new(molt_provision::ProviderRegistry::new());
        let provisioner = Arc::new(Provisioner::new(registry, "docker-local"));
        AppState::new(control, fleet, approvals, provisioner)
    }

    #[test]
    fn bearer_token_parses_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer T".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("T"));

        headers.insert(AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::get("/moltagent/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dashboard_rejects_missing_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::get("/moltagent/dashboard/overview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn dashboard_accepts_the_shared_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::get("/moltagent/dashboard/overview")
                    .header(AUTHORIZATION, "Bearer T")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_agent_detail_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::get("/moltagent/dashboard/agents/ghost")
                    .header(AUTHORIZATION, "Bearer T")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_agent_rejects_invalid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::post("/moltagent/dashboard/agents")
                    .header(AUTHORIZATION, "Bearer T")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"identity":{"name":""}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_agent_with_unknown_provider_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let body = serde_json::json!({
            "identity": {"name": "a1"},
            "resources": {"provider": "vaporware"}
        })
        .to_string();
        let response = app
            .oneshot(
                HttpRequest::post("/moltagent/dashboard/agents")
                    .header(AUTHORIZATION, "Bearer T")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn relay_to_offline_agent_is_503_with_flag() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::post("/moltagent/dashboard/agents/u1/restart")
                    .header(AUTHORIZATION, "Bearer T")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["agentOnline"], false);
    }

    #[tokio::test]
    async fn respond_unknown_approval_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::post("/moltagent/dashboard/approvals/ghost/respond")
                    .header(AUTHORIZATION, "Bearer T")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"approved":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_message_content_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                HttpRequest::post("/moltagent/dashboard/agents/u1/message")
                    .header(AUTHORIZATION, "Bearer T")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content":"  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
