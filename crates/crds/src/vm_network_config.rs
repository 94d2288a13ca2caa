//! VirtualMachineNetworkConfig CRD
//!
//! Couples a VM's NICs to IPPools and carries the per-NIC allocation state.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, ConditionType, is_condition_false, is_condition_true};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.harvesterhci.io",
    version = "v1alpha1",
    kind = "VirtualMachineNetworkConfig",
    plural = "virtualmachinenetworkconfigs",
    shortname = "vmnetcfg",
    namespaced,
    status = "VirtualMachineNetworkConfigStatus",
    printcolumn = r#"{"name":"VMNAME","type":"string","jsonPath":".spec.vmName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineNetworkConfigSpec {
    /// Name of the VM owning these NICs
    pub vm_name: String,

    /// One entry per NIC attached to a managed network
    #[serde(default)]
    pub network_configs: Vec<NetworkConfig>,

    /// Release every address while paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// NIC MAC address
    pub mac_address: String,

    /// Canonical `namespace/name` of the network
    pub network_name: String,

    /// Requested address (hint); the allocator picks one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineNetworkConfigStatus {
    /// Per-NIC allocation state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_configs: Vec<NetworkConfigStatus>,

    /// Allocated, InSynced, Disabled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigStatus {
    /// Address held by this NIC; kept while paused so resumption retries it
    #[serde(rename = "allocatedIPAddress", default, skip_serializing_if = "Option::is_none")]
    pub allocated_ip_address: Option<String>,

    /// NIC MAC address
    pub mac_address: String,

    /// Canonical `namespace/name` of the network
    pub network_name: String,

    /// Allocation state
    pub state: NetworkConfigState,

    /// Reason for the Error state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-NIC allocation state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NetworkConfigState {
    /// Not yet allocated, or paused
    #[default]
    Pending,
    /// Address allocated and lease written
    Allocated,
    /// Allocation refused, see message
    Error,
}

impl NetworkConfigState {
    /// Label value used in the per-NIC status metric.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Allocated => "Allocated",
            Self::Error => "Error",
        }
    }
}

impl VirtualMachineNetworkConfig {
    /// Whether allocation is administratively paused.
    pub fn is_paused(&self) -> bool {
        self.spec.paused.unwrap_or(false)
    }

    /// Prior status entries, empty when absent.
    pub fn status_network_configs(&self) -> &[NetworkConfigStatus] {
        self.status
            .as_ref()
            .map(|s| s.network_configs.as_slice())
            .unwrap_or_default()
    }

    /// Prior status entry for a `(mac, network)` pair.
    pub fn status_for(&self, mac: &str, network: &str) -> Option<&NetworkConfigStatus> {
        self.status_network_configs()
            .iter()
            .find(|s| s.mac_address.eq_ignore_ascii_case(mac) && s.network_name == network)
    }

    /// Whether a condition of the given type is True.
    pub fn condition_true(&self, type_: ConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, type_))
    }

    /// Whether a condition of the given type is False.
    pub fn condition_false(&self, type_: ConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_false(&s.conditions, type_))
    }
}
