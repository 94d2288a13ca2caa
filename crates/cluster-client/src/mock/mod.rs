//! Mock ClusterClient for unit testing
//!
//! Stores resources in memory and mimics the API server behaviours the
//! reconcilers depend on:
//! - every write bumps `metadata.resourceVersion`
//! - writes carrying a stale resource version fail with `Conflict`
//! - deleting an object with finalizers only sets `deletionTimestamp`;
//!   it disappears once its finalizers are cleared
//!
//! Conflicts on IPPool status writes can be injected to exercise retries.

mod resources;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use crds::{IPPool, NetworkAttachmentDefinition, VirtualMachineNetworkConfig};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

type Key = (String, String);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) ippools: Arc<Mutex<HashMap<String, IPPool>>>,
    pub(crate) vmnetcfgs: Arc<Mutex<HashMap<Key, VirtualMachineNetworkConfig>>>,
    pub(crate) pods: Arc<Mutex<HashMap<Key, Pod>>>,
    pub(crate) nads: Arc<Mutex<HashMap<Key, NetworkAttachmentDefinition>>>,
    pub(crate) nodes: Arc<Mutex<Vec<Node>>>,
    pub(crate) next_resource_version: Arc<Mutex<u64>>,
    pub(crate) pending_status_conflicts: Arc<Mutex<u32>>,
    pub(crate) ippool_status_writes: Arc<Mutex<u32>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create a new, empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Next resource version
    pub(crate) fn bump(&self) -> String {
        let mut rv = lock(&self.next_resource_version);
        *rv += 1;
        rv.to_string()
    }

    pub(crate) fn now() -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time> {
        crds::time::from_utc(Utc::now())
    }

    /// Add an IPPool to the mock store (for test setup)
    pub fn add_ippool(&self, mut pool: IPPool) -> IPPool {
        pool.metadata.resource_version = Some(self.bump());
        if pool.metadata.creation_timestamp.is_none() {
            pool.metadata.creation_timestamp = Self::now();
        }
        lock(&self.ippools).insert(pool.name_any(), pool.clone());
        pool
    }

    /// Add a VMNetCfg to the mock store (for test setup)
    pub fn add_vmnetcfg(&self, mut cfg: VirtualMachineNetworkConfig) -> VirtualMachineNetworkConfig {
        cfg.metadata.resource_version = Some(self.bump());
        if cfg.metadata.creation_timestamp.is_none() {
            cfg.metadata.creation_timestamp = Self::now();
        }
        let key = (cfg.namespace().unwrap_or_default(), cfg.name_any());
        lock(&self.vmnetcfgs).insert(key, cfg.clone());
        cfg
    }

    /// Add a pod to the mock store (for test setup)
    pub fn add_pod(&self, mut pod: Pod) -> Pod {
        pod.metadata.resource_version = Some(self.bump());
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        lock(&self.pods).insert(key, pod.clone());
        pod
    }

    /// Add a network attachment definition (for test setup)
    pub fn add_network_attachment_definition(&self, namespace: &str, name: &str) {
        let mut nad = NetworkAttachmentDefinition::new(name, Default::default());
        nad.metadata.namespace = Some(namespace.to_string());
        lock(&self.nads).insert((namespace.to_string(), name.to_string()), nad);
    }

    /// Add a node (for test setup)
    pub fn add_node(&self, node: Node) {
        lock(&self.nodes).push(node);
    }

    /// Current stored IPPool
    pub fn ippool(&self, name: &str) -> Option<IPPool> {
        lock(&self.ippools).get(name).cloned()
    }

    /// Current stored VMNetCfg
    pub fn vmnetcfg(&self, namespace: &str, name: &str) -> Option<VirtualMachineNetworkConfig> {
        lock(&self.vmnetcfgs)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Stored pods of a namespace
    pub fn pods_in(&self, namespace: &str) -> Vec<Pod> {
        lock(&self.pods)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    /// Replace a stored pod as-is (e.g. to flip its readiness)
    pub fn put_pod(&self, pod: Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        lock(&self.pods).insert(key, pod);
    }

    /// Make the next `n` IPPool status writes fail with `Conflict`
    pub fn inject_ippool_status_conflicts(&self, n: u32) {
        *lock(&self.pending_status_conflicts) = n;
    }

    /// Number of IPPool status writes attempted so far
    pub fn ippool_status_writes(&self) -> u32 {
        *lock(&self.ippool_status_writes)
    }

    /// Start deleting an IPPool as the API server would
    pub fn mark_ippool_deleting(&self, name: &str) {
        if let Some(pool) = lock(&self.ippools).get_mut(name) {
            pool.metadata.deletion_timestamp = Self::now();
        }
    }

    /// Start deleting a VMNetCfg as the API server would
    pub fn mark_vmnetcfg_deleting(&self, namespace: &str, name: &str) {
        if let Some(cfg) = lock(&self.vmnetcfgs).get_mut(&(namespace.to_string(), name.to_string())) {
            cfg.metadata.deletion_timestamp = Self::now();
        }
    }
}

/// Whether `labels` satisfy an equality-based selector such as `a=b,c=d`.
pub(crate) fn matches_selector(
    labels: &std::collections::BTreeMap<String, String>,
    selector: &str,
) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).is_some_and(|l| l == v.trim()),
            None => labels.contains_key(term),
        })
}
