//! `kube`-backed [`ClusterClient`].

use crds::{
    IPPool, IPPoolStatus, NetworkAttachmentDefinition, VirtualMachineNetworkConfig,
    VirtualMachineNetworkConfigStatus,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crate::patch::{finalizers_patch, status_patch};

/// Talks to the API server through a shared [`kube::Client`].
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wraps an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying client, for watchers.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn ippools(&self) -> Api<IPPool> {
        Api::all(self.client.clone())
    }

    fn vmnetcfgs(&self, namespace: &str) -> Api<VirtualMachineNetworkConfig> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn required_namespace(cfg: &VirtualMachineNetworkConfig) -> Result<String, ClusterError> {
    cfg.namespace()
        .ok_or_else(|| ClusterError::InvalidRequest(format!("vmnetcfg {} has no namespace", cfg.name_any())))
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_ippools(&self) -> Result<Vec<IPPool>, ClusterError> {
        Ok(self.ippools().list(&ListParams::default()).await?.items)
    }

    async fn get_ippool(&self, name: &str) -> Result<Option<IPPool>, ClusterError> {
        Ok(self.ippools().get_opt(name).await?)
    }

    async fn update_ippool_status(&self, original: &IPPool, status: &IPPoolStatus) -> Result<IPPool, ClusterError> {
        let name = original.name_any();
        let patch = status_patch(
            original.status.as_ref(),
            status,
            original.metadata.resource_version.as_deref(),
        )?;
        debug!(ippool = %name, "Patching IPPool status");
        self.ippools()
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("ippool {name}")))
    }

    async fn set_ippool_finalizers(&self, original: &IPPool, finalizers: Vec<String>) -> Result<IPPool, ClusterError> {
        let name = original.name_any();
        let patch = finalizers_patch(&finalizers, original.metadata.resource_version.as_deref());
        self.ippools()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("ippool {name}")))
    }

    async fn get_vmnetcfg(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineNetworkConfig>, ClusterError> {
        Ok(self.vmnetcfgs(namespace).get_opt(name).await?)
    }

    async fn list_vmnetcfgs(&self, namespace: Option<&str>) -> Result<Vec<VirtualMachineNetworkConfig>, ClusterError> {
        let api: Api<VirtualMachineNetworkConfig> = match namespace {
            Some(ns) => self.vmnetcfgs(ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let ns = required_namespace(cfg)?;
        self.vmnetcfgs(&ns)
            .create(&PostParams::default(), cfg)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("vmnetcfg {ns}/{}", cfg.name_any())))
    }

    async fn update_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let ns = required_namespace(cfg)?;
        let name = cfg.name_any();
        self.vmnetcfgs(&ns)
            .replace(&name, &PostParams::default(), cfg)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("vmnetcfg {ns}/{name}")))
    }

    async fn update_vmnetcfg_status(
        &self,
        original: &VirtualMachineNetworkConfig,
        status: &VirtualMachineNetworkConfigStatus,
    ) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let ns = required_namespace(original)?;
        let name = original.name_any();
        let patch = status_patch(
            original.status.as_ref(),
            status,
            original.metadata.resource_version.as_deref(),
        )?;
        self.vmnetcfgs(&ns)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("vmnetcfg {ns}/{name}")))
    }

    async fn set_vmnetcfg_finalizers(
        &self,
        original: &VirtualMachineNetworkConfig,
        finalizers: Vec<String>,
    ) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let ns = required_namespace(original)?;
        let name = original.name_any();
        let patch = finalizers_patch(&finalizers, original.metadata.resource_version.as_deref());
        self.vmnetcfgs(&ns)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("vmnetcfg {ns}/{name}")))
    }

    async fn delete_vmnetcfg(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        match self.vmnetcfgs(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match ClusterError::from_kube(e, format!("vmnetcfg {namespace}/{name}")) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(label_selector)).await?.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let ns = pod
            .namespace()
            .ok_or_else(|| ClusterError::InvalidRequest("pod has no namespace".to_string()))?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), pod)
            .await
            .map_err(|e| ClusterError::from_kube(e, format!("pod {ns}/{}", pod.name_any())))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match ClusterError::from_kube(e, format!("pod {namespace}/{name}")) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_network_attachment_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>, ClusterError> {
        let api: Api<NetworkAttachmentDefinition> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}
