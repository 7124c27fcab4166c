//! Error types for the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("deployment {0} already exists")]
    DuplicateDeployment(String),

    #[error("node {0} already exists")]
    DuplicateNode(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {node} does not belong to deployment {deployment}")]
    CrossDeployment { node: String, deployment: String },

    #[error("failed to persist state: {0}")]
    Persist(String),
}
