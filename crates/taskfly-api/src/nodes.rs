//! Node-facing handlers — the endpoints agents call back into.
//!
//! Registration trades the one-time provision token for a long-lived
//! auth token; every later call presents that token as a bearer and is
//! re-checked in constant time against the stored value.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use taskfly_metadata::ConfigValue;
use taskfly_state::{Deployment, LogEntry, Node, NodeStatus, SystemMetrics};

use crate::{ApiError, ApiState};

fn generate_auth_token() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("at_{}", hex::encode(bytes))
}

fn tokens_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing auth token"))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid authorization header"))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;
    if token.is_empty() {
        return Err(ApiError::unauthorized("missing auth token"));
    }
    Ok(token.to_string())
}

/// Resolve the calling node from its bearer token, double-checking the
/// stored token against the presented one.
fn resolve_node(state: &ApiState, headers: &HeaderMap) -> Result<(Node, Deployment), ApiError> {
    let token = bearer_token(headers)?;
    let (node, deployment) = state
        .store
        .find_node_by_auth_token(&token)
        .ok_or_else(|| ApiError::unauthorized("invalid auth token"))?;
    if !tokens_match(&node.auth_token, &token) {
        warn!(node_id = %node.node_id, "auth token mismatch for resolved node");
        return Err(ApiError::forbidden("auth token mismatch"));
    }
    Ok((node, deployment))
}

// ── Registration ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub provision_token: String,
    /// Self-reported source address; kept for audit logging only.
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub auth_token: String,
    pub deployment_id: String,
    pub node_id: String,
    pub assets_url: String,
    pub heartbeat_url: String,
    pub status_url: String,
    pub logs_url: String,
    /// Name of the script the agent should run from the bundle root;
    /// empty when the deployment has none.
    pub entry_script: String,
    pub config: BTreeMap<String, ConfigValue>,
}

/// POST /api/v1/nodes/register
pub async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let (node, deployment) = state
        .store
        .find_node_by_provision_token(&request.provision_token)
        .ok_or_else(|| {
            warn!("registration attempt with invalid provision token");
            ApiError::unauthorized("invalid provision token")
        })?;

    if let Some(ip) = &request.ip {
        debug!(node_id = %node.node_id, reported_ip = %ip, "registration source address");
    }

    // The token must not collide with any live token.
    let auth_token = loop {
        let candidate = generate_auth_token();
        if state.store.find_node_by_auth_token(&candidate).is_none() {
            break candidate;
        }
    };

    state
        .store
        .update_node_auth_token(&deployment.id, &node.node_id, &auth_token)
        .map_err(|e| {
            error!(node_id = %node.node_id, error = %e, "failed to issue auth token");
            ApiError::internal("failed to register node")
        })?;
    state
        .store
        .update_node_status(&deployment.id, &node.node_id, NodeStatus::Registering, None)
        .map_err(|e| {
            error!(node_id = %node.node_id, error = %e, "failed to update node status");
            ApiError::internal("failed to register node")
        })?;

    info!(node_id = %node.node_id, deployment_id = %deployment.id, "node registered");

    let base = state.orchestrator.callback_url();
    Ok(Json(RegisterResponse {
        auth_token,
        deployment_id: deployment.id,
        node_id: node.node_id,
        assets_url: format!("{base}/api/v1/nodes/assets"),
        heartbeat_url: format!("{base}/api/v1/nodes/heartbeat"),
        status_url: format!("{base}/api/v1/nodes/status"),
        logs_url: format!("{base}/api/v1/nodes/logs"),
        entry_script: deployment.config.remote_script_to_run,
        config: node.config,
    }))
}

// ── Assets ─────────────────────────────────────────────────────────

/// GET /api/v1/nodes/assets
pub async fn assets(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (node, deployment) = resolve_node(&state, &headers)?;

    let file = tokio::fs::File::open(&deployment.bundle_path)
        .await
        .map_err(|e| {
            error!(
                deployment_id = %deployment.id,
                path = %deployment.bundle_path.display(),
                error = %e,
                "worker bundle missing on disk"
            );
            ApiError::internal("bundle file not found")
        })?;

    if let Err(e) = state.store.update_node_status(
        &deployment.id,
        &node.node_id,
        NodeStatus::DownloadingAssets,
        None,
    ) {
        error!(node_id = %node.node_id, error = %e, "failed to mark node downloading");
    }
    debug!(node_id = %node.node_id, deployment_id = %deployment.id, "streaming worker bundle");

    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, "application/gzip")], body))
}

// ── Heartbeat ──────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub metrics: Option<SystemMetrics>,
}

/// POST /api/v1/nodes/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (node, deployment) = resolve_node(&state, &headers)?;

    if let Some(metrics) = request.metrics {
        if let Err(e) = state
            .store
            .update_node_metrics(&deployment.id, &node.node_id, metrics)
        {
            error!(node_id = %node.node_id, error = %e, "failed to store metrics");
        }
    }

    if let Err(e) = state.store.update_node_last_seen(&deployment.id, &node.node_id) {
        error!(node_id = %node.node_id, error = %e, "failed to update last seen");
    }

    // A heartbeat implies the agent is alive and working; promote any
    // non-terminal, non-running node. Terminal statuses stay put.
    if !node.status.is_terminal() && node.status != NodeStatus::Running {
        if let Err(e) =
            state
                .store
                .update_node_status(&deployment.id, &node.node_id, NodeStatus::Running, None)
        {
            error!(node_id = %node.node_id, error = %e, "failed to promote node to running");
        }
    }

    Ok(Json(serde_json::json!({
        "status": "ok",
        "shutdown": node.should_shutdown,
    })))
}

// ── Status updates ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /api/v1/nodes/status
pub async fn update_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<StatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (node, deployment) = resolve_node(&state, &headers)?;

    let status: NodeStatus = request
        .status
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown node status: {}", request.status)))?;

    state
        .store
        .update_node_status(&deployment.id, &node.node_id, status, None)
        .map_err(|e| {
            error!(node_id = %node.node_id, error = %e, "failed to update node status");
            ApiError::internal("failed to update node status")
        })?;

    if let Some(message) = &request.message {
        if let Err(e) = state
            .store
            .update_node_message(&deployment.id, &node.node_id, message)
        {
            error!(node_id = %node.node_id, error = %e, "failed to update node message");
        }
    }

    info!(node_id = %node.node_id, %status, "node status updated");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ── Log push ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LogsRequest {
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// POST /api/v1/nodes/logs
pub async fn push_logs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<LogsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (node, deployment) = resolve_node(&state, &headers)?;

    let count = request.logs.len();
    state
        .store
        .append_logs(&deployment.id, &node.node_id, request.logs)
        .map_err(|e| {
            error!(node_id = %node.node_id, error = %e, "failed to store logs");
            ApiError::internal("failed to store logs")
        })?;

    debug!(node_id = %node.node_id, count, "log entries received");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
