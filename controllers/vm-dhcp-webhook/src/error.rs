//! Webhook error types.

use cluster_client::ClusterError;
use metrics_server::MetricsError;
use thiserror::Error;

/// Errors that can occur in the admission webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The object is rejected; the message is returned to the client
    #[error("{0}")]
    ValidationFailed(String),

    /// Cluster read failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid command-line configuration or serving certificate
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Listener error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
