//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transport or API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency check failed (HTTP 409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (e.g., missing name or resource version)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Leadership could not be acquired or was lost
    #[error("Leader election: {0}")]
    LeaderElection(String),
}

impl ClusterError {
    /// Maps API status codes onto `Conflict`/`NotFound`.
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(what.into()),
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(what.into()),
            _ => Self::Kube(err),
        }
    }

    /// Whether the error is a resource-version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the error is a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
