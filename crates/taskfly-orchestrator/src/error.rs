//! Error types for the deployment controller.

use taskfly_state::DeploymentStatus;
use thiserror::Error;

/// Result type alias for controller operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the deployment controller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Bundle(#[from] taskfly_bundle::BundleError),

    #[error(transparent)]
    Metadata(#[from] taskfly_metadata::MetadataError),

    #[error(transparent)]
    State(#[from] taskfly_state::StateError),

    #[error("unsupported compute backend: {0}")]
    UnsupportedBackend(String),

    #[error("deployment {id} is {status}, only completed, failed, or terminated deployments can be cleaned up")]
    CleanupNotAllowed { id: String, status: DeploymentStatus },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether the error is the submitter's fault (bad bundle or
    /// descriptor) rather than a controller-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Bundle(_)
                | OrchestratorError::Metadata(_)
                | OrchestratorError::CleanupNotAllowed { .. }
        )
    }
}
