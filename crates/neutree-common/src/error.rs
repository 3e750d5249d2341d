use thiserror::Error;

/// Failure kinds whose handling diverges from plain propagation.
///
/// Everything else travels as `anyhow::Error` with context attached; callers
/// recover these with `err.downcast_ref::<ClusterError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    /// Objects still exist after a delete sweep; the caller should requeue.
    #[error("waiting for resources of cluster {0} to be deleted")]
    WaitForDeletion(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ClusterError {
    /// Returns the `ClusterError` carried somewhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&ClusterError> {
        err.chain().find_map(|e| e.downcast_ref::<ClusterError>())
    }

    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(ClusterError::NotFound(_)))
    }

    pub fn is_wait_for_deletion(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(ClusterError::WaitForDeletion(_)))
    }
}
