//! ClusterClient implementation for MockClusterClient

use crds::{
    IPPool, IPPoolStatus, NetworkAttachmentDefinition, VirtualMachineNetworkConfig,
    VirtualMachineNetworkConfigStatus,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use super::{MockClusterClient, lock, matches_selector};
use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;

fn check_version(
    stored: Option<&String>,
    given: Option<&String>,
    what: &str,
) -> Result<(), ClusterError> {
    match given {
        Some(rv) if Some(rv) != stored => Err(ClusterError::Conflict(format!(
            "{what}: resource version {rv} is stale"
        ))),
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn list_ippools(&self) -> Result<Vec<IPPool>, ClusterError> {
        Ok(lock(&self.ippools).values().cloned().collect())
    }

    async fn get_ippool(&self, name: &str) -> Result<Option<IPPool>, ClusterError> {
        Ok(self.ippool(name))
    }

    async fn update_ippool_status(&self, original: &IPPool, status: &IPPoolStatus) -> Result<IPPool, ClusterError> {
        *lock(&self.ippool_status_writes) += 1;
        let name = original.name_any();
        {
            let mut pending = lock(&self.pending_status_conflicts);
            if *pending > 0 {
                *pending -= 1;
                return Err(ClusterError::Conflict(format!("ippool {name}: injected conflict")));
            }
        }
        let rv = self.bump();
        let mut pools = lock(&self.ippools);
        let stored = pools
            .get_mut(&name)
            .ok_or_else(|| ClusterError::NotFound(format!("ippool {name}")))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            original.metadata.resource_version.as_ref(),
            &format!("ippool {name}"),
        )?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(rv);
        Ok(stored.clone())
    }

    async fn set_ippool_finalizers(&self, original: &IPPool, finalizers: Vec<String>) -> Result<IPPool, ClusterError> {
        let name = original.name_any();
        let rv = self.bump();
        let mut pools = lock(&self.ippools);
        let stored = pools
            .get_mut(&name)
            .ok_or_else(|| ClusterError::NotFound(format!("ippool {name}")))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            original.metadata.resource_version.as_ref(),
            &format!("ippool {name}"),
        )?;
        stored.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
        stored.metadata.resource_version = Some(rv);
        let updated = stored.clone();
        if updated.metadata.deletion_timestamp.is_some() && updated.metadata.finalizers.is_none() {
            pools.remove(&name);
        }
        Ok(updated)
    }

    async fn get_vmnetcfg(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachineNetworkConfig>, ClusterError> {
        Ok(self.vmnetcfg(namespace, name))
    }

    async fn list_vmnetcfgs(&self, namespace: Option<&str>) -> Result<Vec<VirtualMachineNetworkConfig>, ClusterError> {
        Ok(lock(&self.vmnetcfgs)
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|n| n == ns))
            .map(|(_, cfg)| cfg.clone())
            .collect())
    }

    async fn create_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let key = (cfg.namespace().unwrap_or_default(), cfg.name_any());
        if lock(&self.vmnetcfgs).contains_key(&key) {
            return Err(ClusterError::Conflict(format!("vmnetcfg {}/{} already exists", key.0, key.1)));
        }
        let mut created = cfg.clone();
        created.status = None;
        Ok(self.add_vmnetcfg(created))
    }

    async fn update_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let key = (cfg.namespace().unwrap_or_default(), cfg.name_any());
        let what = format!("vmnetcfg {}/{}", key.0, key.1);
        let rv = self.bump();
        let mut cfgs = lock(&self.vmnetcfgs);
        let stored = cfgs
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(what.clone()))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            cfg.metadata.resource_version.as_ref(),
            &what,
        )?;
        stored.spec = cfg.spec.clone();
        stored.metadata.labels = cfg.metadata.labels.clone();
        stored.metadata.owner_references = cfg.metadata.owner_references.clone();
        stored.metadata.resource_version = Some(rv);
        Ok(stored.clone())
    }

    async fn update_vmnetcfg_status(
        &self,
        original: &VirtualMachineNetworkConfig,
        status: &VirtualMachineNetworkConfigStatus,
    ) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let key = (original.namespace().unwrap_or_default(), original.name_any());
        let what = format!("vmnetcfg {}/{}", key.0, key.1);
        let rv = self.bump();
        let mut cfgs = lock(&self.vmnetcfgs);
        let stored = cfgs
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(what.clone()))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            original.metadata.resource_version.as_ref(),
            &what,
        )?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(rv);
        Ok(stored.clone())
    }

    async fn set_vmnetcfg_finalizers(
        &self,
        original: &VirtualMachineNetworkConfig,
        finalizers: Vec<String>,
    ) -> Result<VirtualMachineNetworkConfig, ClusterError> {
        let key = (original.namespace().unwrap_or_default(), original.name_any());
        let what = format!("vmnetcfg {}/{}", key.0, key.1);
        let rv = self.bump();
        let mut cfgs = lock(&self.vmnetcfgs);
        let stored = cfgs
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(what.clone()))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            original.metadata.resource_version.as_ref(),
            &what,
        )?;
        stored.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
        stored.metadata.resource_version = Some(rv);
        let updated = stored.clone();
        if updated.metadata.deletion_timestamp.is_some() && updated.metadata.finalizers.is_none() {
            cfgs.remove(&key);
        }
        Ok(updated)
    }

    async fn delete_vmnetcfg(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        let mut cfgs = lock(&self.vmnetcfgs);
        let has_finalizers = cfgs
            .get(&key)
            .is_some_and(|c| c.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()));
        if has_finalizers {
            if let Some(cfg) = cfgs.get_mut(&key) {
                cfg.metadata.deletion_timestamp = Self::now();
            }
        } else {
            cfgs.remove(&key);
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .pods_in(namespace)
            .into_iter()
            .filter(|p| matches_selector(p.labels(), label_selector))
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        if lock(&self.pods).contains_key(&key) {
            return Err(ClusterError::Conflict(format!("pod {}/{} already exists", key.0, key.1)));
        }
        Ok(self.add_pod(pod.clone()))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        lock(&self.pods).remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_network_attachment_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>, ClusterError> {
        Ok(lock(&self.nads)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(lock(&self.nodes).clone())
    }
}
