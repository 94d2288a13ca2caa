//! Controller-specific error types.
//!
//! Wraps the errors of the allocators, the lease table and the cluster
//! client, and decides which of them are worth retrying.

use cluster_client::ClusterError;
use dhcp_server::DhcpError;
use ipam::IpamError;
use kube::Error as KubeError;
use metrics_server::MetricsError;
use thiserror::Error;

/// Errors that can occur in the VM DHCP controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client construction or watch error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster read or write failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// IP or MAC allocator error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Lease table error
    #[error("DHCP lease error: {0}")]
    Dhcp(#[from] DhcpError),

    /// Metrics registration or HTTP server error
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Invalid command-line or environment configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object content that no retry will fix
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Unrecoverable condition; the process exits
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ControllerError {
    /// Whether a failed reconcile should be requeued.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ValidationFailed(_)
                | Self::Ipam(IpamError::OutOfRange(_) | IpamError::Exhausted(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_retryable_kinds() {
        assert!(!ControllerError::ValidationFailed("bad".to_string()).is_retryable());
        assert!(!ControllerError::Ipam(IpamError::OutOfRange(Ipv4Addr::LOCALHOST)).is_retryable());
        assert!(!ControllerError::Ipam(IpamError::Exhausted("default/net-1".to_string())).is_retryable());
        assert!(ControllerError::Cluster(ClusterError::Conflict("ippool".to_string())).is_retryable());
        assert!(ControllerError::Ipam(IpamError::SubnetNotFound("default/net-1".to_string())).is_retryable());
    }
}
