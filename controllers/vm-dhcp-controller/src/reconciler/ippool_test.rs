//! Unit tests for IPPool reconciliation

use std::net::Ipv4Addr;

use chrono::{Duration as ChronoDuration, Utc};
use crds::labels::FINALIZER;
use crds::{ConditionType, IPPoolStatus, IPv4Status, RESERVED_TAG, is_condition_false, is_condition_true};
use kube::ResourceExt;
use serde_json::json;

use super::agent::build_agent_pod;
use super::ippool::{pool_range, sentinel_addresses};
use crate::error::ControllerError;
use crate::test_utils::{AGENT_NAMESPACE, create_test_ip_pool, create_test_reconciler, create_test_vmnetcfg};

const NETWORK: &str = "default/net-1";

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn status(pool: &crds::IPPool) -> IPPoolStatus {
    pool.status.clone().unwrap()
}

#[test]
fn test_sentinels_and_range() {
    let mut pool = create_test_ip_pool("net-1", NETWORK);
    pool.spec.ipv4.pool.exclude = vec!["192.168.0.150".to_string(), "10.0.0.1".to_string()];
    let parsed = pool.spec.ipv4.parse().unwrap();

    let tags = sentinel_addresses(&parsed);
    assert_eq!(tags.len(), 3, "out-of-cidr exclude is ignored");
    assert_eq!(tags[&ip("192.168.0.1")], RESERVED_TAG);
    assert_eq!(tags[&ip("192.168.0.2")], RESERVED_TAG);
    assert_eq!(tags[&ip("192.168.0.150")], crds::EXCLUDED_TAG);

    assert_eq!(pool_range(&parsed), (ip("192.168.0.101"), ip("192.168.0.200")));
    pool.spec.ipv4.pool.start = String::new();
    pool.spec.ipv4.pool.end = String::new();
    let parsed = pool.spec.ipv4.parse().unwrap();
    assert_eq!(pool_range(&parsed), (ip("192.168.0.1"), ip("192.168.0.254")));
}

#[tokio::test]
async fn test_reconcile_installs_subnet_and_agent() {
    let (reconciler, client) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("net-1", NETWORK));

    reconciler.reconcile_ippool(&pool).await.unwrap();

    let stored = client.ippool("net-1").unwrap();
    assert!(stored.finalizers().iter().any(|f| f == FINALIZER));
    assert!(reconciler.ipam.has_subnet(NETWORK));
    assert!(reconciler.cache.has_mac_set(NETWORK));

    let st = status(&stored);
    let ipv4 = st.ipv4.as_ref().unwrap();
    assert_eq!(ipv4.allocated.get("192.168.0.1").map(String::as_str), Some(RESERVED_TAG));
    assert_eq!(ipv4.allocated.get("192.168.0.2").map(String::as_str), Some(RESERVED_TAG));
    assert_eq!(ipv4.used, 0);
    assert_eq!(ipv4.available, 100);
    assert!(is_condition_true(&st.conditions, ConditionType::Registered));
    assert!(is_condition_true(&st.conditions, ConditionType::CacheReady));
    assert!(is_condition_false(&st.conditions, ConditionType::AgentReady));
    assert!(is_condition_false(&st.conditions, ConditionType::Ready));
    assert!(st.last_update.is_some());

    let pods = client.pods_in(AGENT_NAMESPACE);
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].name_any(), "default-net-1-agent");
    assert_eq!(st.agent_pod_ref.as_ref().unwrap().name, "default-net-1-agent");

    // Agent becomes ready
    let mut pod = pods[0].clone();
    pod.status = Some(serde_json::from_value(json!({
        "conditions": [{ "type": "Ready", "status": "True" }]
    })).unwrap());
    client.put_pod(pod);

    reconciler.reconcile_ippool(&stored).await.unwrap();
    let st = status(&client.ippool("net-1").unwrap());
    assert!(is_condition_true(&st.conditions, ConditionType::AgentReady));
    assert!(is_condition_true(&st.conditions, ConditionType::Ready));
    assert_eq!(client.pods_in(AGENT_NAMESPACE).len(), 1, "agent pod is not recreated");
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (reconciler, client) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("net-1", NETWORK));
    reconciler.reconcile_ippool(&pool).await.unwrap();

    let stored = client.ippool("net-1").unwrap();
    let writes = client.ippool_status_writes();
    reconciler.reconcile_ippool(&stored).await.unwrap();

    assert_eq!(client.ippool_status_writes(), writes, "unchanged status is not written");
    assert_eq!(client.ippool("net-1").unwrap().status, stored.status);
}

#[tokio::test]
async fn test_excluded_addresses_are_revoked() {
    let (reconciler, client) = create_test_reconciler();
    let mut pool = create_test_ip_pool("net-1", NETWORK);
    pool.spec.ipv4.pool.exclude = vec!["192.168.0.101".to_string(), "192.168.0.102".to_string()];
    let pool = client.add_ippool(pool);

    reconciler.reconcile_ippool(&pool).await.unwrap();

    let ipv4 = status(&client.ippool("net-1").unwrap()).ipv4.unwrap();
    assert_eq!(ipv4.allocated.get("192.168.0.101").map(String::as_str), Some(crds::EXCLUDED_TAG));
    assert_eq!(ipv4.available, 98);
    assert_eq!(
        reconciler.ipam.allocate_ip(NETWORK, Ipv4Addr::UNSPECIFIED).unwrap(),
        ip("192.168.0.103")
    );
}

#[tokio::test]
async fn test_server_ip_change_recreates_agent() {
    let (reconciler, client) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("net-1", NETWORK));
    reconciler.reconcile_ippool(&pool).await.unwrap();

    let mut moved = client.ippool("net-1").unwrap();
    moved.spec.ipv4.server_ip = "192.168.0.3".to_string();
    reconciler.reconcile_ippool(&moved).await.unwrap();

    assert!(client.pods_in(AGENT_NAMESPACE).is_empty(), "outdated agent pod is deleted");
    let st = status(&client.ippool("net-1").unwrap());
    let agent = crds::get_condition(&st.conditions, ConditionType::AgentReady).unwrap();
    assert_eq!(agent.reason.as_deref(), Some("AgentOutdated"));
}

#[tokio::test]
async fn test_multiple_agents_are_reported() {
    let (reconciler, client) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("net-1", NETWORK));
    let parsed = pool.spec.ipv4.parse().unwrap();

    let first = build_agent_pod(&pool, &parsed, &reconciler.agent).unwrap();
    let mut second = first.clone();
    second.metadata.name = Some("default-net-1-agent-old".to_string());
    client.add_pod(first);
    client.add_pod(second);

    reconciler.reconcile_ippool(&pool).await.unwrap();

    let st = status(&client.ippool("net-1").unwrap());
    let agent = crds::get_condition(&st.conditions, ConditionType::AgentReady).unwrap();
    assert_eq!(agent.reason.as_deref(), Some("AgentMisconfigured"));
    assert!(is_condition_false(&st.conditions, ConditionType::Ready));
}

#[tokio::test]
async fn test_paused_pool() {
    let (reconciler, client) = create_test_reconciler();
    let mut pool = create_test_ip_pool("net-1", NETWORK);
    pool.spec.paused = Some(true);
    let pool = client.add_ippool(pool);

    reconciler.reconcile_ippool(&pool).await.unwrap();

    let st = status(&client.ippool("net-1").unwrap());
    assert!(is_condition_true(&st.conditions, ConditionType::Disabled));
    assert!(is_condition_false(&st.conditions, ConditionType::Ready));
    assert!(!reconciler.ipam.has_subnet(NETWORK));
    assert!(client.pods_in(AGENT_NAMESPACE).is_empty());
}

#[tokio::test]
async fn test_invalid_spec_is_not_retried() {
    let (reconciler, client) = create_test_reconciler();
    let mut pool = create_test_ip_pool("net-1", NETWORK);
    pool.spec.ipv4.cidr = "192.168.0.0/33".to_string();
    let pool = client.add_ippool(pool);

    let err = reconciler.reconcile_ippool(&pool).await.unwrap_err();
    assert!(matches!(err, ControllerError::ValidationFailed(_)));
    assert!(!err.is_retryable());

    let st = status(&client.ippool("net-1").unwrap());
    let registered = crds::get_condition(&st.conditions, ConditionType::Registered).unwrap();
    assert_eq!(registered.reason.as_deref(), Some("InvalidSpec"));
}

#[tokio::test]
async fn test_startup_replay_rebuilds_allocator() {
    let (reconciler, client) = create_test_reconciler();
    let mac = "aa:bb:cc:dd:ee:01";
    let before = Utc::now() - ChronoDuration::hours(1);

    let mut pool = create_test_ip_pool("net-1", NETWORK);
    pool.spec.ipv4.pool.exclude = vec!["192.168.0.151".to_string()];
    pool.status = Some(IPPoolStatus {
        ipv4: Some(IPv4Status {
            allocated: [
                ("192.168.0.150".to_string(), mac.to_string()),
                ("192.168.0.151".to_string(), crds::EXCLUDED_TAG.to_string()),
            ]
            .into_iter()
            .collect(),
            used: 1,
            available: 98,
        }),
        last_update: Some(before),
        ..Default::default()
    });
    client.add_ippool(pool);

    reconciler.startup_replay().await.unwrap();

    assert!(reconciler.ipam.is_allocated(NETWORK, ip("192.168.0.150")));
    assert!(reconciler.ipam.revoked(NETWORK).contains(&ip("192.168.0.151")));
    assert_eq!(reconciler.cache.get_ip_by_mac(NETWORK, mac).unwrap(), ip("192.168.0.150"));

    let st = status(&client.ippool("net-1").unwrap());
    assert_eq!(st.last_update_before_start, Some(before));
    assert!(st.last_update.unwrap() > before);
    assert_eq!(st.ipv4.as_ref().unwrap().used, 1);
    assert!(reconciler.replayed_at(NETWORK).is_some());

    // The matching config finds its address already in place
    let mut cfg = create_test_vmnetcfg("default", "vm-1", &[(mac, NETWORK, None)]);
    cfg.status = Some(crds::VirtualMachineNetworkConfigStatus {
        network_configs: vec![crds::NetworkConfigStatus {
            allocated_ip_address: Some("192.168.0.150".to_string()),
            mac_address: mac.to_string(),
            network_name: NETWORK.to_string(),
            state: crds::NetworkConfigState::Allocated,
            message: None,
        }],
        conditions: Vec::new(),
    });
    let cfg = client.add_vmnetcfg(cfg);
    let writes = client.ippool_status_writes();

    reconciler.reconcile_vmnetcfg(&cfg).await.unwrap();

    assert_eq!(client.ippool_status_writes(), writes, "pool status untouched");
    assert_eq!(reconciler.ipam.get_used(NETWORK).unwrap(), 1);
    let lease = reconciler.leases.get_lease(mac).unwrap();
    assert_eq!(lease.client_ip, ip("192.168.0.150"));
    let stored = client.vmnetcfg("default", "vm-1").unwrap();
    assert_eq!(
        stored.status_network_configs()[0].allocated_ip_address.as_deref(),
        Some("192.168.0.150")
    );
}

#[tokio::test]
async fn test_deleted_pool_is_cleaned_up() {
    let (reconciler, client) = create_test_reconciler();
    let pool = client.add_ippool(create_test_ip_pool("net-1", NETWORK));
    reconciler.reconcile_ippool(&pool).await.unwrap();

    let mac = "aa:bb:cc:dd:ee:01";
    let cfg = client.add_vmnetcfg(create_test_vmnetcfg("default", "vm-1", &[(mac, NETWORK, None)]));
    reconciler.reconcile_vmnetcfg(&cfg).await.unwrap();
    assert!(reconciler.leases.check_lease(mac));

    client.mark_ippool_deleting("net-1");
    let deleting = client.ippool("net-1").unwrap();
    reconciler.reconcile_ippool(&deleting).await.unwrap();

    assert!(client.ippool("net-1").is_none(), "finalizer removed");
    assert!(client.pods_in(AGENT_NAMESPACE).is_empty());
    assert!(!reconciler.ipam.has_subnet(NETWORK));
    assert!(!reconciler.cache.has_mac_set(NETWORK));
    assert!(!reconciler.leases.check_lease(mac));
    assert!(reconciler.replayed_at(NETWORK).is_none());
}
