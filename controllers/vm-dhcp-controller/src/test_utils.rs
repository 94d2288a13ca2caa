//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and wiring a
//! reconciler to an in-memory cluster.

use std::sync::Arc;

use cluster_client::MockClusterClient;
use crds::{
    IPPool, IPPoolSpec, IPv4Config, NetworkConfig, Pool, VirtualMachine, VirtualMachineNetworkConfig,
    VirtualMachineNetworkConfigSpec,
};
use dhcp_server::LeaseTable;
use ipam::{CacheAllocator, IpAllocator};
use metrics_server::Metrics;
use serde_json::json;

use crate::reconciler::{AgentSettings, Reconciler};

/// Namespace agent pods are deployed to in tests
pub const AGENT_NAMESPACE: &str = "harvester-system";

/// Helper to create a test IPPool: `192.168.0.0/24`, range `.101-.200`,
/// server `.2`, router `.1`
pub fn create_test_ip_pool(name: &str, network: &str) -> IPPool {
    IPPool::new(
        name,
        IPPoolSpec {
            network_name: network.to_string(),
            ipv4: IPv4Config {
                server_ip: "192.168.0.2".to_string(),
                cidr: "192.168.0.0/24".to_string(),
                pool: Pool {
                    start: "192.168.0.101".to_string(),
                    end: "192.168.0.200".to_string(),
                    exclude: Vec::new(),
                },
                router: Some("192.168.0.1".to_string()),
                dns: vec!["8.8.8.8".to_string()],
                ..Default::default()
            },
            paused: None,
        },
    )
}

/// Helper to create a test VirtualMachineNetworkConfig
pub fn create_test_vmnetcfg(namespace: &str, name: &str, nics: &[(&str, &str, Option<&str>)]) -> VirtualMachineNetworkConfig {
    let mut cfg = VirtualMachineNetworkConfig::new(
        name,
        VirtualMachineNetworkConfigSpec {
            vm_name: name.to_string(),
            network_configs: nics
                .iter()
                .map(|(mac, network, ip)| NetworkConfig {
                    mac_address: (*mac).to_string(),
                    network_name: (*network).to_string(),
                    ip_address: ip.map(str::to_string),
                })
                .collect(),
            paused: None,
        },
    );
    cfg.metadata.namespace = Some(namespace.to_string());
    cfg
}

/// Helper to create a test VirtualMachine from `(interface, multus network, mac)`
/// triples, plus a pod-network NIC named `default`
pub fn create_test_vm(namespace: &str, name: &str, nics: &[(&str, &str, Option<&str>)]) -> VirtualMachine {
    let mut interfaces = vec![json!({ "name": "default", "masquerade": {} })];
    let mut networks = vec![json!({ "name": "default", "pod": {} })];
    for (iface, network, mac) in nics {
        let mut interface = json!({ "name": iface, "bridge": {} });
        if let Some(mac) = mac {
            interface["macAddress"] = json!(mac);
        }
        interfaces.push(interface);
        networks.push(json!({ "name": iface, "multus": { "networkName": network } }));
    }
    serde_json::from_value(json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": format!("uid-{name}"),
        },
        "spec": {
            "template": {
                "spec": {
                    "domain": { "devices": { "interfaces": interfaces } },
                    "networks": networks,
                },
            },
        },
    }))
    .unwrap()
}

/// Reconciler over fresh allocators and a mock cluster
pub fn create_test_reconciler() -> (Reconciler, MockClusterClient) {
    let client = MockClusterClient::new();
    let reconciler = Reconciler::new(
        Arc::new(client.clone()),
        Arc::new(IpAllocator::new()),
        Arc::new(CacheAllocator::new()),
        Arc::new(LeaseTable::new()),
        Arc::new(Metrics::new().unwrap()),
        AgentSettings {
            namespace: AGENT_NAMESPACE.to_string(),
            image: "vm-dhcp-agent:test".to_string(),
            service_account: None,
        },
    );
    (reconciler, client)
}
