//! KubeVirt `VirtualMachine` subset.
//!
//! Only the fields needed to derive NIC → network bindings are modelled;
//! unknown fields are ignored on read and the object is never written back.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::labels::MAC_ADDRESS_ANNOTATION;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, Default)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// VMI template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceTemplate {
    /// VMI spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<VirtualMachineInstanceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Domain definition
    #[serde(default)]
    pub domain: DomainSpec,

    /// Networks the interfaces attach to
    #[serde(default)]
    pub networks: Vec<Network>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Devices
    #[serde(default)]
    pub devices: Devices,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Network interfaces
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Interface name, matches a `Network` name
    pub name: String,

    /// MAC address from the spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Network name, matches an `Interface` name
    pub name: String,

    /// Pod network source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodNetwork>,

    /// Multus network source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<MultusNetwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodNetwork {
    /// CIDR for the VM network
    #[serde(rename = "vmNetworkCIDR", default, skip_serializing_if = "Option::is_none")]
    pub vm_network_cidr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MultusNetwork {
    /// `namespace/name` or `name` of the network attachment definition
    pub network_name: String,

    /// Whether this is the default pod network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

impl VirtualMachine {
    /// Interfaces declared in the VMI template.
    pub fn interfaces(&self) -> &[Interface] {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.domain.devices.interfaces.as_slice())
            .unwrap_or_default()
    }

    /// Networks declared in the VMI template.
    pub fn networks(&self) -> &[Network] {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.networks.as_slice())
            .unwrap_or_default()
    }

    /// Interface name → MAC recorded in the MAC-address annotation.
    ///
    /// A missing or malformed annotation yields an empty map.
    pub fn annotated_macs(&self) -> BTreeMap<String, String> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(MAC_ADDRESS_ANNOTATION))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}
