//! Agent-specific error types.

use cluster_client::ClusterError;
use dhcp_server::DhcpError;
use kube::Error as KubeError;
use metrics_server::MetricsError;
use thiserror::Error;

/// Errors that can occur in the DHCP agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Kubernetes client construction or watch error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster read failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Lease table or packet server error
    #[error("DHCP error: {0}")]
    Dhcp(#[from] DhcpError),

    /// Metrics registration or HTTP server error
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Invalid command-line or environment configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Unrecoverable condition; the process exits
    #[error("Fatal: {0}")]
    Fatal(String),
}
