//! VirtualMachineNetworkConfig validation.

use cluster_client::ClusterClient;
use crds::{NetworkName, VirtualMachineNetworkConfig};
use kube::ResourceExt;

use crate::error::WebhookError;

/// Every NIC must sit on a network some IPPool serves.
pub async fn validate_vmnetcfg(client: &dyn ClusterClient, cfg: &VirtualMachineNetworkConfig) -> Result<(), WebhookError> {
    let namespace = cfg.namespace().unwrap_or_default();
    let pools = client.list_ippools().await?;

    for nic in &cfg.spec.network_configs {
        let network = NetworkName::parse(&nic.network_name, Some(&namespace)).map_err(|e| {
            WebhookError::ValidationFailed(format!("vmnetcfg {namespace}/{}: {e}", cfg.name_any()))
        })?;
        if !pools.iter().any(|p| p.network().is_ok_and(|n| n == network)) {
            return Err(WebhookError::ValidationFailed(format!(
                "vmnetcfg {namespace}/{}: ippool for network {network} not found",
                cfg.name_any()
            )));
        }
    }
    Ok(())
}
