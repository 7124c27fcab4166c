//! Error types for bundle processing.

use thiserror::Error;

/// Result type alias for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

/// Errors that can occur while processing or extracting a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("descriptor taskfly.yml not found in bundle")]
    DescriptorMissing,

    #[error("failed to parse taskfly.yml: {0}")]
    DescriptorParse(#[from] serde_yaml::Error),

    #[error("archive entry escapes the extraction directory: {0}")]
    UnsafeArchivePath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
