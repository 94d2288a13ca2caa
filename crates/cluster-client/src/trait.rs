//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API calls made by reconcilers so that
//! unit tests can run against an in-memory mock.

use crds::{IPPool, IPPoolStatus, NetworkAttachmentDefinition, VirtualMachineNetworkConfig, VirtualMachineNetworkConfigStatus};
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::error::ClusterError;

/// Trait for Kubernetes API operations
///
/// Writes that take the original object are compare-and-swap on its
/// `metadata.resourceVersion` and fail with [`ClusterError::Conflict`]
/// when the stored object has moved on.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    // IPPool operations
    async fn list_ippools(&self) -> Result<Vec<IPPool>, ClusterError>;
    async fn get_ippool(&self, name: &str) -> Result<Option<IPPool>, ClusterError>;
    async fn update_ippool_status(&self, original: &IPPool, status: &IPPoolStatus) -> Result<IPPool, ClusterError>;
    async fn set_ippool_finalizers(&self, original: &IPPool, finalizers: Vec<String>) -> Result<IPPool, ClusterError>;

    // VirtualMachineNetworkConfig operations
    async fn get_vmnetcfg(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineNetworkConfig>, ClusterError>;
    async fn list_vmnetcfgs(&self, namespace: Option<&str>) -> Result<Vec<VirtualMachineNetworkConfig>, ClusterError>;
    async fn create_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<VirtualMachineNetworkConfig, ClusterError>;
    async fn update_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<VirtualMachineNetworkConfig, ClusterError>;
    async fn update_vmnetcfg_status(&self, original: &VirtualMachineNetworkConfig, status: &VirtualMachineNetworkConfigStatus) -> Result<VirtualMachineNetworkConfig, ClusterError>;
    async fn set_vmnetcfg_finalizers(&self, original: &VirtualMachineNetworkConfig, finalizers: Vec<String>) -> Result<VirtualMachineNetworkConfig, ClusterError>;
    async fn delete_vmnetcfg(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // Pod operations
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ClusterError>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // Other lookups
    async fn get_network_attachment_definition(&self, namespace: &str, name: &str) -> Result<Option<NetworkAttachmentDefinition>, ClusterError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
}
