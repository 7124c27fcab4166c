//! Operator-facing handlers.

use std::collections::HashMap;
use std::path::Path as FsPath;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use taskfly_orchestrator::OrchestratorError;
use taskfly_state::{Deployment, Node, NodeStatus, StateError, SystemMetrics};

use crate::{ApiError, ApiState};

fn map_orchestrator_error(e: OrchestratorError) -> ApiError {
    match &e {
        OrchestratorError::State(StateError::DeploymentNotFound(_))
        | OrchestratorError::State(StateError::NodeNotFound(_)) => {
            ApiError::not_found(e.to_string())
        }
        _ if e.is_client_error() => ApiError::bad_request(e.to_string()),
        _ => {
            error!(error = %e, "controller operation failed");
            ApiError::internal(e.to_string())
        }
    }
}

// ── Submission ─────────────────────────────────────────────────────

/// POST /api/v1/deployments
///
/// Accepts a multipart upload with a `bundle` field, saves it under a
/// timestamped name, and hands it to the controller.
pub async fn submit_deployment(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("bundle") {
            continue;
        }

        // Keep only the final path component of the client-supplied name.
        let filename = field
            .file_name()
            .map(|name| {
                FsPath::new(name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "bundle.tar.gz".to_string())
            })
            .unwrap_or_else(|| "bundle.tar.gz".to_string());

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read bundle upload: {e}")))?;
        info!(%filename, size = data.len(), "bundle received");

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let upload_path = state
            .orchestrator
            .deployment_dir()
            .join(format!("{timestamp}_{filename}"));
        tokio::fs::write(&upload_path, &data).await.map_err(|e| {
            error!(path = %upload_path.display(), error = %e, "failed to save uploaded bundle");
            ApiError::internal("failed to save bundle")
        })?;

        let deployment = state
            .orchestrator
            .submit(&upload_path)
            .await
            .map_err(map_orchestrator_error)?;

        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "deployment_id": deployment.id,
                "status": deployment.status,
                "nodes": deployment.total_nodes,
                "status_url": format!("/api/v1/deployments/{}", deployment.id),
                "message": format!(
                    "Deployment accepted. Provisioning {} nodes.",
                    deployment.total_nodes
                ),
            })),
        ));
    }

    Err(ApiError::bad_request("no bundle file provided"))
}

// ── Listing and detail ─────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Json<Vec<Deployment>> {
    Json(state.store.get_all_deployments())
}

#[derive(Serialize)]
pub struct NodeView {
    node_id: String,
    node_index: u32,
    status: NodeStatus,
    last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            node_id: node.node_id,
            node_index: node.node_index,
            status: node.status,
            last_update: node.last_update,
            ip_address: node.ip_address,
            instance_id: node.instance_id,
            error_message: node.error_message,
        }
    }
}

#[derive(Serialize)]
pub struct DeploymentDetail {
    #[serde(flatten)]
    deployment: Deployment,
    nodes: Vec<NodeView>,
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentDetail>, ApiError> {
    let deployment = state
        .store
        .get_deployment(&id)
        .map_err(|_| ApiError::not_found("deployment not found"))?;
    let nodes = state
        .store
        .get_nodes_by_deployment(&id)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(DeploymentDetail {
        deployment,
        nodes: nodes.into_iter().map(NodeView::from).collect(),
    }))
}

// ── Termination and cleanup ────────────────────────────────────────

/// DELETE /api/v1/deployments/{id}
pub async fn terminate_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .terminate_deployment(&id)
        .await
        .map_err(map_orchestrator_error)?;
    Ok(Json(serde_json::json!({
        "message": "deployment termination initiated"
    })))
}

/// POST /api/v1/deployments/{id}/cleanup
pub async fn cleanup_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .cleanup_deployment(&id)
        .map_err(map_orchestrator_error)?;
    Ok(Json(serde_json::json!({
        "message": "deployment cleaned up"
    })))
}

/// POST /api/v1/cleanup/all
pub async fn cleanup_all(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (cleaned, failed) = state.orchestrator.cleanup_all_completed();
    Json(serde_json::json!({
        "cleaned": cleaned,
        "failed": failed,
    }))
}

// ── Logs ───────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct LogsQuery {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/deployments/{id}/logs
pub async fn get_deployment_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since = match &query.since {
        None => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    ApiError::bad_request("invalid 'since' parameter, must be RFC 3339")
                })?,
        ),
    };

    let logs = state
        .store
        .get_logs(&id, query.node.as_deref(), since, query.limit.unwrap_or(0))
        .map_err(|_| ApiError::not_found("deployment not found"))?;

    Ok(Json(serde_json::json!({
        "deployment_id": id,
        "count": logs.len(),
        "logs": logs,
    })))
}

// ── Metrics ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct MetricsNode {
    node_id: String,
    ip_address: String,
    status: NodeStatus,
    metrics: Option<SystemMetrics>,
    last_update: DateTime<Utc>,
}

/// GET /api/v1/metrics
///
/// Aggregates per-node metrics fleet-wide. Nodes are deduplicated by IP
/// address, keeping the most recently updated record per address.
pub async fn get_metrics(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let mut by_ip: HashMap<String, Node> = HashMap::new();
    for deployment in state.store.get_all_deployments() {
        let Ok(nodes) = state.store.get_nodes_by_deployment(&deployment.id) else {
            continue;
        };
        for node in nodes {
            let Some(ip) = node.ip_address.clone() else {
                continue;
            };
            match by_ip.get(&ip) {
                Some(existing) if existing.last_update >= node.last_update => {}
                _ => {
                    by_ip.insert(ip, node);
                }
            }
        }
    }

    let mut total_cores: u64 = 0;
    let mut total_memory: u64 = 0;
    let mut total_memory_used: u64 = 0;
    let mut load_sum = 0.0;
    let mut with_metrics = 0usize;

    let mut nodes: Vec<MetricsNode> = by_ip
        .into_values()
        .map(|node| {
            if let Some(metrics) = &node.metrics {
                total_cores += u64::from(metrics.cpu_cores);
                total_memory += metrics.memory_total;
                total_memory_used += metrics.memory_used;
                load_sum += metrics.load_avg_1;
                with_metrics += 1;
            }
            MetricsNode {
                node_id: node.node_id,
                ip_address: node.ip_address.unwrap_or_default(),
                status: node.status,
                metrics: node.metrics,
                last_update: node.last_update,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));

    let avg_load = if with_metrics > 0 {
        load_sum / with_metrics as f64
    } else {
        0.0
    };
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    Json(serde_json::json!({
        "summary": {
            "total_cores": total_cores,
            "total_memory_gb": total_memory as f64 / GB,
            "total_memory_used_gb": total_memory_used as f64 / GB,
            "avg_load": avg_load,
            "nodes_with_metrics": with_metrics,
        },
        "nodes": nodes,
    }))
}

// ── Health and stats ───────────────────────────────────────────────

/// GET /api/v1/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let stats = state.store.get_stats();
    Json(serde_json::json!({
        "total_deployments": stats.total_deployments,
        "total_nodes": stats.total_nodes,
        "total_logs": stats.total_logs,
        "deployment_status": stats.deployment_status,
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}
