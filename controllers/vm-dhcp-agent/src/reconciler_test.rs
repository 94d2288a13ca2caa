//! Unit tests for lease synchronisation

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use cluster_client::{ClusterClient, MockClusterClient};
use crds::{
    IPPool, IPPoolSpec, IPPoolStatus, IPv4Config, IPv4Status, NetworkConfig, Pool, VirtualMachineNetworkConfig,
    VirtualMachineNetworkConfigSpec,
};
use dhcp_server::{DhcpServerSet, LeaseTable};
use metrics_server::{AppState, Metrics};

use crate::config::AgentConfig;
use crate::reconciler::Reconciler;

const NETWORK: &str = "default/net-1";
const MAC_1: &str = "aa:bb:cc:dd:ee:01";
const MAC_2: &str = "aa:bb:cc:dd:ee:02";

fn create_test_ip_pool(name: &str, allocated: &[(&str, &str)]) -> IPPool {
    let mut pool = IPPool::new(
        name,
        IPPoolSpec {
            network_name: NETWORK.to_string(),
            ipv4: IPv4Config {
                server_ip: "192.168.0.2".to_string(),
                cidr: "192.168.0.0/24".to_string(),
                pool: Pool {
                    start: "192.168.0.101".to_string(),
                    end: "192.168.0.200".to_string(),
                    exclude: vec!["192.168.0.150".to_string()],
                },
                router: Some("192.168.0.1".to_string()),
                dns: vec!["8.8.8.8".to_string()],
                ..Default::default()
            },
            paused: None,
        },
    );
    pool.status = Some(status(allocated));
    pool
}

fn status(allocated: &[(&str, &str)]) -> IPPoolStatus {
    IPPoolStatus {
        ipv4: Some(IPv4Status {
            allocated: allocated
                .iter()
                .map(|(ip, tag)| ((*ip).to_string(), (*tag).to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_test_vmnetcfg(namespace: &str, vm: &str, mac: &str) -> VirtualMachineNetworkConfig {
    let mut cfg = VirtualMachineNetworkConfig::new(
        vm,
        VirtualMachineNetworkConfigSpec {
            vm_name: vm.to_string(),
            network_configs: vec![NetworkConfig {
                mac_address: mac.to_uppercase(),
                network_name: "net-1".to_string(),
                ip_address: None,
            }],
            paused: None,
        },
    );
    cfg.metadata.namespace = Some(namespace.to_string());
    cfg
}

fn create_test_reconciler() -> (Reconciler, MockClusterClient, Arc<LeaseTable>, AppState) {
    let client = MockClusterClient::new();
    let leases = Arc::new(LeaseTable::new());
    let servers = Arc::new(DhcpServerSet::new(leases.clone()));
    let config = AgentConfig::parse(
        r#"[{"namespace":"default","name":"net-1","interface":"eth1"}]"#,
        r#"[{"namespace":"default","name":"pool-1"}]"#,
    )
    .unwrap();
    let state = AppState::new(Arc::new(Metrics::new().unwrap()));
    let reconciler = Reconciler::new(Arc::new(client.clone()), servers, config, true, state.clone());
    (reconciler, client, leases, state)
}

#[tokio::test]
async fn test_leases_follow_pool_status() {
    let (reconciler, client, leases, state) = create_test_reconciler();
    client.add_vmnetcfg(create_test_vmnetcfg("default", "vm-1", MAC_1));
    let pool = client.add_ippool(create_test_ip_pool(
        "pool-1",
        &[
            ("192.168.0.1", "RESERVED"),
            ("192.168.0.2", "RESERVED"),
            ("192.168.0.101", MAC_1),
            ("192.168.0.102", "AA:BB:CC:DD:EE:02"),
            ("192.168.0.150", "EXCLUDED"),
        ],
    ));

    reconciler.reconcile_ippool(&pool).await.unwrap();

    let all = leases.list_all(None);
    assert_eq!(all.len(), 2, "sentinel entries get no lease");
    let lease = leases.get_lease(MAC_1).unwrap();
    assert_eq!(lease.client_ip, Ipv4Addr::new(192, 168, 0, 101));
    assert_eq!(lease.server_ip, Ipv4Addr::new(192, 168, 0, 2));
    assert_eq!(lease.router, Some(Ipv4Addr::new(192, 168, 0, 1)));
    assert_eq!(lease.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(lease.reference, "default/vm-1");
    assert_eq!(leases.get_lease(MAC_2).unwrap().reference, "", "no config names this MAC");
    assert!(state.ready.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn test_leases_are_updated_and_removed() {
    let (reconciler, client, leases, _state) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool(
        "pool-1",
        &[("192.168.0.101", MAC_1), ("192.168.0.102", MAC_2)],
    ));
    reconciler.reconcile_ippool(&pool).await.unwrap();
    assert_eq!(leases.list_all(None).len(), 2);

    let pool = client
        .update_ippool_status(&pool, &status(&[("192.168.0.103", MAC_1)]))
        .await
        .unwrap();
    reconciler.reconcile_ippool(&pool).await.unwrap();

    assert_eq!(leases.get_lease(MAC_1).unwrap().client_ip, Ipv4Addr::new(192, 168, 0, 103));
    assert!(!leases.check_lease(MAC_2));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (reconciler, client, leases, _state) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("pool-1", &[("192.168.0.101", MAC_1)]));

    reconciler.reconcile_ippool(&pool).await.unwrap();
    let before = leases.list_all(None);
    reconciler.reconcile_ippool(&pool).await.unwrap();

    assert_eq!(leases.list_all(None), before);
}

#[tokio::test]
async fn test_foreign_pool_is_ignored() {
    let (reconciler, client, leases, state) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("pool-2", &[("192.168.0.101", MAC_1)]));

    reconciler.reconcile_ippool(&pool).await.unwrap();

    assert!(leases.list_all(None).is_empty());
    assert!(!state.ready.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn test_deleting_pool_drops_its_leases() {
    let (reconciler, client, leases, _state) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("pool-1", &[("192.168.0.101", MAC_1)]));
    reconciler.reconcile_ippool(&pool).await.unwrap();
    assert!(leases.check_lease(MAC_1));

    client.mark_ippool_deleting("pool-1");
    let pool = client.ippool("pool-1").unwrap();
    reconciler.reconcile_ippool(&pool).await.unwrap();

    assert!(leases.list_all(None).is_empty());
}
