//! Error types for the in-place upgrade operator.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types for upgrade coordination and draining
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error talking to the node agent
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object creation collided with an existing object
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upgrade lock is held by another record
    #[error("Upgrade lock is held: {0}")]
    LockHeld(String),

    /// Lock record present but unreadable
    #[error("Invalid lock record: {0}")]
    InvalidLock(String),

    /// Upgrade instruction is not understood by the refresh service
    #[error("Invalid upgrade option: {0}")]
    InvalidUpgradeOption(String),

    /// Refresh service could not be reached or refused the call
    #[error("Refresh service error: {0}")]
    Refresh(String),

    /// Object is missing a field the operator needs
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Drain failure
    #[error("Drain error: {0}")]
    Drain(#[from] DrainError),
}

impl Error {
    /// Whether the error is an expected, retry-later condition rather than a fault.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::LockHeld(_) | Error::Refresh(_) | Error::Http(_)
        )
    }
}

/// Drain-specific errors
#[derive(Debug, Error)]
pub enum DrainError {
    /// Pod managed by a DaemonSet while DaemonSet pods are not ignored
    #[error("pod {namespace}/{name} is managed by a DaemonSet; cannot drain node without ignore_daemonsets")]
    DaemonSetPod { namespace: String, name: String },

    /// Pod with emptyDir data while deleting local data is not allowed
    #[error("pod {namespace}/{name} is using an emptyDir volume; cannot drain node without delete_emptydir_data")]
    EmptyDirPod { namespace: String, name: String },

    /// Pod without a managing controller while force is off
    #[error("pod {namespace}/{name} does not have a controller; cannot drain node without force")]
    UnmanagedPod { namespace: String, name: String },

    /// Overall drain deadline exceeded
    #[error("timed out draining node {node} after {after:?}")]
    Timeout { node: String, after: Duration },

    /// API failure while draining
    #[error("failed to {action} on node {node}: {message}")]
    Api {
        node: String,
        action: &'static str,
        message: String,
    },
}

impl DrainError {
    /// Structural problems need operator intervention or a policy change.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DrainError::DaemonSetPod { .. }
                | DrainError::EmptyDirPod { .. }
                | DrainError::UnmanagedPod { .. }
        )
    }
}
