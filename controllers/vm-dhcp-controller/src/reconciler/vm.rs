//! VM → VirtualMachineNetworkConfig derivation.
//!
//! Every VM NIC attached to a Multus network that has an IPPool gets one
//! entry in a VirtualMachineNetworkConfig named after the VM.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use crds::labels::VM_NAME_LABEL_KEY;
use crds::{
    ConditionType, IPPool, NetworkConfig, NetworkConfigState, NetworkConfigStatus, NetworkName, VirtualMachine,
    VirtualMachineNetworkConfig, VirtualMachineNetworkConfigSpec, set_condition,
};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use super::Reconciler;
use super::vmnetcfg::{NETWORK_CONFIG_CHANGED, network_config_changed, nic_network};
use crate::error::ControllerError;

/// Delay before the second phase of a NIC removal.
const RESYNC_DELAY: Duration = Duration::from_secs(1);

fn same_nic(a: &NetworkConfig, mac: &str, network: &str) -> bool {
    a.mac_address.eq_ignore_ascii_case(mac) && a.network_name == network
}

/// NIC bindings of `vm` on networks served by one of `pools`.
///
/// Pod-network NICs and NICs without a MAC yet are skipped. A MAC set in
/// the spec wins over the one recorded in the MAC-address annotation.
pub fn derive_network_configs(vm: &VirtualMachine, pools: &[IPPool]) -> Result<Vec<NetworkConfig>, ControllerError> {
    let namespace = vm.namespace().unwrap_or_default();
    let annotated = vm.annotated_macs();
    let served: HashSet<NetworkName> = pools.iter().filter_map(|p| p.network().ok()).collect();

    let mut configs = Vec::new();
    let mut seen = BTreeSet::new();
    for iface in vm.interfaces() {
        let Some(multus) = vm
            .networks()
            .iter()
            .find(|n| n.name == iface.name)
            .and_then(|n| n.multus.as_ref())
        else {
            continue;
        };
        let network = match NetworkName::parse(&multus.network_name, Some(&namespace)) {
            Ok(network) => network,
            Err(e) => {
                warn!(vm = %vm.name_any(), interface = %iface.name, error = %e, "Skipping interface");
                continue;
            }
        };
        if !served.contains(&network) {
            continue;
        }
        let Some(mac) = iface
            .mac_address
            .clone()
            .or_else(|| annotated.get(&iface.name).cloned())
            .filter(|m| !m.trim().is_empty())
        else {
            debug!(vm = %vm.name_any(), interface = %iface.name, "Interface has no MAC yet");
            continue;
        };

        let mac = mac.trim().to_lowercase();
        let network_name = network.to_string();
        if !seen.insert((mac.clone(), network_name.clone())) {
            return Err(ControllerError::ValidationFailed(format!(
                "vm {namespace}/{}: mac {mac} appears twice on network {network_name}",
                vm.name_any()
            )));
        }
        configs.push(NetworkConfig {
            mac_address: mac,
            network_name,
            ip_address: None,
        });
    }
    Ok(configs)
}

/// The VirtualMachineNetworkConfig derived for `vm`.
pub fn build_vmnetcfg(vm: &VirtualMachine, network_configs: Vec<NetworkConfig>) -> VirtualMachineNetworkConfig {
    let name = vm.name_any();
    let mut cfg = VirtualMachineNetworkConfig::new(
        &name,
        VirtualMachineNetworkConfigSpec {
            vm_name: name.clone(),
            network_configs,
            paused: None,
        },
    );
    cfg.metadata.namespace = vm.namespace();
    cfg.metadata.labels = Some(BTreeMap::from([(VM_NAME_LABEL_KEY.to_string(), name)]));
    cfg.metadata.owner_references = vm.controller_owner_ref(&()).map(|owner| vec![owner]);
    cfg
}

impl Reconciler {
    /// Reconciles one VM into its VirtualMachineNetworkConfig.
    pub async fn reconcile_vm(&self, vm: &VirtualMachine) -> Result<Action, ControllerError> {
        let namespace = vm.namespace().unwrap_or_default();
        let name = vm.name_any();
        info!("Reconciling VirtualMachine {}/{}", namespace, name);

        let live = self.client.get_vmnetcfg(&namespace, &name).await?;
        if vm.meta().deletion_timestamp.is_some() {
            if live.is_some() {
                self.client.delete_vmnetcfg(&namespace, &name).await?;
            }
            return Ok(Action::await_change());
        }

        let pools = self.client.list_ippools().await?;
        let mut desired = derive_network_configs(vm, &pools)?;
        if desired.is_empty() {
            if live.is_some() {
                info!(vm = %name, "VM has no managed interfaces, deleting its network config");
                self.client.delete_vmnetcfg(&namespace, &name).await?;
            }
            return Ok(Action::await_change());
        }

        let reference = format!("{namespace}/{name}");
        for nc in &desired {
            if let Some(lease) = self.leases.get_lease(&nc.mac_address) {
                if lease.reference != reference {
                    return Err(ControllerError::ValidationFailed(format!(
                        "mac {} of vm {reference} is leased to {}",
                        nc.mac_address, lease.reference
                    )));
                }
            }
        }

        let Some(live) = live else {
            let created = self.client.create_vmnetcfg(&build_vmnetcfg(vm, desired)).await?;
            info!(vmnetcfg = %created.name_any(), namespace = %namespace, "Created VirtualMachineNetworkConfig");
            return Ok(Action::await_change());
        };

        // Requested addresses are owned by the live object
        for nc in &mut desired {
            nc.ip_address = live
                .spec
                .network_configs
                .iter()
                .find(|l| same_nic(l, &nc.mac_address, &nc.network_name))
                .and_then(|l| l.ip_address.clone());
        }
        if live.spec.network_configs == desired {
            return Ok(Action::await_change());
        }
        self.sync_vmnetcfg(live, desired).await
    }

    /// Moves a live config to `desired` in two steps when allocated NICs
    /// disappear: first `InSynced=False`, then the spec update and release.
    async fn sync_vmnetcfg(
        &self,
        live: VirtualMachineNetworkConfig,
        desired: Vec<NetworkConfig>,
    ) -> Result<Action, ControllerError> {
        let name = live.name_any();
        let reference = format!("{}/{}", live.namespace().unwrap_or_default(), live.spec.vm_name);
        let in_desired = |s: &NetworkConfigStatus| desired.iter().any(|d| same_nic(d, &s.mac_address, &s.network_name));
        let removed: Vec<NetworkConfigStatus> = live
            .status_network_configs()
            .iter()
            .filter(|s| !in_desired(s))
            .cloned()
            .collect();
        let drops_allocated = removed
            .iter()
            .any(|s| s.state == NetworkConfigState::Allocated);

        if drops_allocated && !network_config_changed(&live) {
            info!(vmnetcfg = %name, "Network configuration changed, releasing removed interfaces next");
            let mut status = live.status.clone().unwrap_or_default();
            set_condition(
                &mut status.conditions,
                ConditionType::InSynced,
                false,
                NETWORK_CONFIG_CHANGED,
                "network interfaces removed from the VM",
            );
            self.client.update_vmnetcfg_status(&live, &status).await?;
            return Ok(Action::requeue(RESYNC_DELAY));
        }

        let mut updated = live.clone();
        updated.spec.network_configs = desired.clone();
        let updated = self.client.update_vmnetcfg(&updated).await?;
        info!(vmnetcfg = %name, "Updated VirtualMachineNetworkConfig spec");

        for s in &removed {
            let ip = s.allocated_ip_address.as_deref().and_then(|ip| ip.parse().ok());
            let network = nic_network(&updated, &s.network_name);
            self.release_nic(&reference, &network, &s.mac_address, ip, true)
                .await?;
        }

        let mut status = updated.status.clone().unwrap_or_default();
        status.network_configs.retain(|s| in_desired(s));
        set_condition(&mut status.conditions, ConditionType::InSynced, true, "", "");
        if updated.status.as_ref() != Some(&status) {
            self.client.update_vmnetcfg_status(&updated, &status).await?;
        }
        Ok(Action::await_change())
    }
}
