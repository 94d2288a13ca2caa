//! Well-known label, annotation and finalizer keys.

/// Label selecting every agent pod
pub const VM_DHCP_CONTROLLER_LABEL_KEY: &str = "network.harvesterhci.io/vm-dhcp-controller";

/// Value of [`VM_DHCP_CONTROLLER_LABEL_KEY`] on agent pods
pub const AGENT_LABEL_VALUE: &str = "agent";

/// Namespace of the pool's network on agent pods
pub const IPPOOL_NAMESPACE_LABEL_KEY: &str = "network.harvesterhci.io/ippool-namespace";

/// IPPool name on agent pods
pub const IPPOOL_NAME_LABEL_KEY: &str = "network.harvesterhci.io/ippool-name";

/// VM name on derived VMNetCfgs
pub const VM_NAME_LABEL_KEY: &str = "network.harvesterhci.io/vm-name";

/// Server address (`ip/prefix`) the agent pod was built for
pub const AGENT_SERVER_IP_ANNOTATION: &str = "network.harvesterhci.io/server-ip";

/// Multus secondary networks annotation
pub const MULTUS_NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// JSON map of interface name → MAC written on VMs
pub const MAC_ADDRESS_ANNOTATION: &str = "harvesterhci.io/mac-address";

/// Finalizer guarding IPPool and VMNetCfg cleanup
pub const FINALIZER: &str = "network.harvesterhci.io/vm-dhcp-controller";

/// Interface name of the pool network inside the agent pod
pub const AGENT_INTERFACE: &str = "eth1";

/// Label selector matching every agent pod.
pub fn agent_selector() -> String {
    format!("{VM_DHCP_CONTROLLER_LABEL_KEY}={AGENT_LABEL_VALUE}")
}

/// Label selector matching the agent pod of one pool.
pub fn agent_selector_for(pool_name: &str) -> String {
    format!("{},{IPPOOL_NAME_LABEL_KEY}={pool_name}", agent_selector())
}
