//! taskfly-state — deployment and node state for the TaskFly controller.
//!
//! The [`Store`] owns every deployment, node, and log entry in the
//! process. All other components read snapshots and apply mutations
//! through its API; no live references to stored entities ever escape.
//! Deployments and nodes are persisted to a single `state.json` on every
//! mutation (temp file + atomic rename); logs are ephemeral by design.

mod error;
mod store;
mod types;

pub use error::{StateError, StateResult};
pub use store::{Store, StoreStats, DEFAULT_LOG_CAPACITY};
pub use types::{
    Deployment, DeploymentConfig, DeploymentStatus, LogEntry, LogStream, Node, NodeStatus,
    SystemMetrics,
};
