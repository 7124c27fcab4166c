//! taskfly-api — HTTP API for the TaskFly controller.
//!
//! Two route groups share one router under `/api/v1`: the operator
//! surface (deployments, logs, metrics, stats) and the node surface the
//! agents call back into (register, assets, heartbeat, status, logs).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/deployments` | Submit a bundle (multipart `bundle`) |
//! | GET | `/api/v1/deployments` | List all deployments |
//! | GET | `/api/v1/deployments/{id}` | Deployment with its nodes |
//! | DELETE | `/api/v1/deployments/{id}` | Terminate a deployment |
//! | POST | `/api/v1/deployments/{id}/cleanup` | Remove a finished deployment |
//! | POST | `/api/v1/cleanup/all` | Remove every finished deployment |
//! | GET | `/api/v1/deployments/{id}/logs` | Captured node logs |
//! | GET | `/api/v1/metrics` | Fleet-wide metrics summary |
//! | GET | `/api/v1/stats` | Store counters and uptime |
//! | GET | `/api/v1/health` | Liveness probe |
//! | POST | `/api/v1/nodes/register` | Provision-token registration |
//! | GET | `/api/v1/nodes/assets` | Worker bundle download (bearer) |
//! | POST | `/api/v1/nodes/heartbeat` | Heartbeat + metrics (bearer) |
//! | POST | `/api/v1/nodes/status` | Node status update (bearer) |
//! | POST | `/api/v1/nodes/logs` | Log push (bearer) |

pub mod client;
pub mod nodes;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use taskfly_orchestrator::Orchestrator;
use taskfly_state::Store;

/// Uploaded bundles may be large; multipart bodies are capped here
/// instead of axum's 2 MB default.
const MAX_BUNDLE_BYTES: usize = 256 * 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let routes = Router::new()
        .route(
            "/deployments",
            get(client::list_deployments).post(client::submit_deployment),
        )
        .route(
            "/deployments/{id}",
            get(client::get_deployment).delete(client::terminate_deployment),
        )
        .route("/deployments/{id}/cleanup", post(client::cleanup_deployment))
        .route("/deployments/{id}/logs", get(client::get_deployment_logs))
        .route("/cleanup/all", post(client::cleanup_all))
        .route("/metrics", get(client::get_metrics))
        .route("/stats", get(client::get_stats))
        .route("/health", get(client::health))
        .route("/nodes/register", post(nodes::register))
        .route("/nodes/assets", get(nodes::assets))
        .route("/nodes/heartbeat", post(nodes::heartbeat))
        .route("/nodes/status", post(nodes::update_status))
        .route("/nodes/logs", post(nodes::push_logs));

    Router::new()
        .nest("/api/v1", routes)
        .layer(DefaultBodyLimit::max(MAX_BUNDLE_BYTES))
        .with_state(state)
}

/// Error response carrying a status code and a `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
