//! Reconciliation logic for IPPools, VM network configs and VMs.
//!
//! - `ippool`: subnet install, status replay, agent deployment (per IPPool)
//! - `vmnetcfg`: per-NIC address allocation and lease writes
//! - `vm`: derives a VirtualMachineNetworkConfig from a VM's interfaces
//! - `agent`: agent pod construction
//!
//! The allocators and the lease table are process-wide and shared by every
//! reconciler. Cluster objects cross-reference each other by network name
//! and MAC address only.

pub mod agent;
pub mod ippool;
pub mod vm;
pub mod vmnetcfg;

#[cfg(test)]
mod ippool_test;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_client::ClusterClient;
use crds::{IPPool, IPPoolStatus, IPv4Status, NetworkName};
use dhcp_server::{DhcpError, LeaseTable};
use ipam::{CacheAllocator, IpAllocator, IpamError};
use kube::ResourceExt;
use metrics_server::Metrics;
use tracing::{debug, info, warn};

use crate::backoff::{ExponentialBackoff, QUEUE_BASE_DELAY, QUEUE_MAX_DELAY, RETRY_BUDGET};
use crate::error::ControllerError;
pub use agent::AgentSettings;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One change to an IPPool's `status.ipv4.allocated` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mirror {
    /// Bind `ip` to `mac`
    Add(Ipv4Addr, String),
    /// Drop `ip` if it is still bound to `mac`
    Remove(Ipv4Addr, String),
}

/// Shared state of every reconciler in the controller process.
pub struct Reconciler {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) ipam: Arc<IpAllocator>,
    pub(crate) cache: Arc<CacheAllocator>,
    pub(crate) leases: Arc<LeaseTable>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) agent: AgentSettings,
    /// Network name -> time its allocator state was rebuilt at startup
    replayed_at: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Per-key requeue backoff (`Kind/namespace/name`)
    backoff_states: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over shared allocators.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        ipam: Arc<IpAllocator>,
        cache: Arc<CacheAllocator>,
        leases: Arc<LeaseTable>,
        metrics: Arc<Metrics>,
        agent: AgentSettings,
    ) -> Self {
        Self {
            client,
            ipam,
            cache,
            leases,
            metrics,
            agent,
            replayed_at: Mutex::new(HashMap::new()),
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Clears the backoff of a key after a successful reconcile.
    pub fn record_success(&self, key: &str) {
        lock(&self.backoff_states).remove(key);
    }

    /// Delay before retrying `key` after `err`, or `None` to drop the item
    /// until its next change event.
    pub fn retry_after(&self, key: &str, err: &ControllerError) -> Option<Duration> {
        let mut states = lock(&self.backoff_states);
        if !err.is_retryable() {
            states.remove(key);
            return None;
        }
        let delay = states.entry(key.to_string()).or_default().next_backoff();
        if delay.is_none() {
            warn!(key = %key, error = %err, "Retry budget spent, dropping item");
            states.remove(key);
        }
        delay
    }

    pub(crate) fn mark_replayed(&self, network: &str, at: DateTime<Utc>) {
        lock(&self.replayed_at).insert(network.to_string(), at);
    }

    pub(crate) fn replayed_at(&self, network: &str) -> Option<DateTime<Utc>> {
        lock(&self.replayed_at).get(network).copied()
    }

    pub(crate) fn forget_replay(&self, network: &str) {
        lock(&self.replayed_at).remove(network);
    }

    /// IPPool serving `network`, if any. Bare names resolve into `default`.
    pub(crate) async fn find_ippool(&self, network: &str) -> Result<Option<IPPool>, ControllerError> {
        let Ok(wanted) = NetworkName::parse(network, None) else {
            return Ok(None);
        };
        Ok(self
            .client
            .list_ippools()
            .await?
            .into_iter()
            .find(|p| p.network().is_ok_and(|n| n == wanted)))
    }

    /// Recomputes `used`/`available` from the allocator.
    pub(crate) fn refresh_counters(&self, network: &str, ipv4: &mut IPv4Status) {
        if let Ok(used) = self.ipam.get_used(network) {
            ipv4.used = used;
        }
        if let Ok(available) = self.ipam.get_available(network) {
            ipv4.available = available;
        }
    }

    pub(crate) fn record_pool_metrics(&self, pool: &IPPool) {
        let ipv4 = pool.status.as_ref().and_then(|s| s.ipv4.as_ref());
        if let Some(ipv4) = ipv4 {
            self.metrics.update_ippool(
                &pool.name_any(),
                &pool.spec.ipv4.cidr,
                &pool.network_key(),
                ipv4.used,
                ipv4.available,
            );
        }
    }

    /// Applies `mutate` to the stored status of IPPool `name` and writes it
    /// back, retrying resource-version conflicts with exponential backoff.
    ///
    /// The status is re-read before each attempt. Nothing is written when
    /// `mutate` leaves it unchanged.
    pub(crate) async fn update_pool_status_with_retry<F>(
        &self,
        name: &str,
        mutate: F,
    ) -> Result<Option<IPPool>, ControllerError>
    where
        F: Fn(&mut IPPoolStatus) + Send + Sync,
    {
        let mut backoff = ExponentialBackoff::new(QUEUE_BASE_DELAY, QUEUE_MAX_DELAY, RETRY_BUDGET);
        loop {
            let Some(pool) = self.client.get_ippool(name).await? else {
                debug!(ippool = %name, "IPPool gone, skipping status write");
                return Ok(None);
            };
            let mut status = pool.status.clone().unwrap_or_default();
            mutate(&mut status);
            if pool.status.as_ref() == Some(&status) {
                return Ok(Some(pool));
            }

            match self.client.update_ippool_status(&pool, &status).await {
                Ok(updated) => {
                    self.record_pool_metrics(&updated);
                    return Ok(Some(updated));
                }
                Err(e) if e.is_conflict() => match backoff.next_backoff() {
                    Some(delay) => {
                        debug!(ippool = %name, attempt = backoff.failures(), ?delay, "IPPool status conflict, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(ippool = %name, "IPPool status still conflicting after retries");
                        return Err(e.into());
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drops `mac` from the MAC index of `network`, if indexed.
    pub(crate) fn forget_mac(&self, network: &str, mac: &str) {
        match self.cache.delete_mac(network, mac) {
            Ok(()) | Err(IpamError::MacNotFound(_)) => {}
            Err(e) => debug!(network = %network, mac = %mac, error = %e, "MAC index not updated"),
        }
    }

    /// Returns `ip` to the allocator of `network`, if allocated.
    pub(crate) fn release_address(&self, network: &str, ip: Ipv4Addr) {
        match self.ipam.release_ip(network, ip) {
            Ok(()) => {}
            Err(IpamError::NotAllocated(_)) => debug!(network = %network, %ip, "Address already free"),
            Err(e) => warn!(network = %network, %ip, error = %e, "Failed to release ip"),
        }
    }

    /// Whether the pool status binds `ip` to anything other than `mac`.
    pub(crate) async fn claimed_by_other(&self, network: &str, ip: Ipv4Addr, mac: &str) -> Result<bool, ControllerError> {
        Ok(self.find_ippool(network).await?.is_some_and(|pool| {
            pool.allocated()
                .get(&ip.to_string())
                .is_some_and(|tag| !tag.eq_ignore_ascii_case(mac))
        }))
    }

    /// Mirrors allocation changes into the pool's `status.ipv4.allocated`.
    pub(crate) async fn mirror_pool_status(&self, network: &str, changes: &[Mirror]) -> Result<(), ControllerError> {
        let Some(pool) = self.find_ippool(network).await? else {
            return Ok(());
        };
        let now = Utc::now();
        self.update_pool_status_with_retry(&pool.name_any(), |status| {
            let ipv4 = status.ipv4.get_or_insert_with(IPv4Status::default);
            let before = ipv4.clone();
            for change in changes {
                match change {
                    Mirror::Add(ip, mac) => {
                        ipv4.allocated.insert(ip.to_string(), mac.clone());
                    }
                    Mirror::Remove(ip, mac) => {
                        let key = ip.to_string();
                        if ipv4.allocated.get(&key).is_some_and(|tag| tag.eq_ignore_ascii_case(mac)) {
                            ipv4.allocated.remove(&key);
                        }
                    }
                }
            }
            self.refresh_counters(network, ipv4);
            if *ipv4 != before {
                status.last_update = Some(now);
            }
        })
        .await?;
        Ok(())
    }

    /// Gives up what one NIC holds on `network` (canonical form): its lease, its address and
    /// its pool status entry. The MAC index entry is dropped too when
    /// `forget_mac` is set, otherwise it is kept so the address can be
    /// recovered later.
    ///
    /// Nothing is released unless the NIC owns it: its own lease must hold
    /// the address, or the MAC index must point at it while the pool status
    /// does not bind it to another MAC.
    pub(crate) async fn release_nic(
        &self,
        reference: &str,
        network: &str,
        mac: &str,
        ip: Option<Ipv4Addr>,
        forget_mac: bool,
    ) -> Result<(), ControllerError> {
        let cached = self.cache.get_ip_by_mac(network, mac).ok();
        let lease = self.leases.get_lease(mac).filter(|l| l.reference == reference);
        let Some(ip) = ip.or(cached).or_else(|| lease.as_ref().map(|l| l.client_ip)) else {
            return Ok(());
        };
        let leased = lease.is_some_and(|l| l.client_ip == ip);
        let owned = leased || (cached == Some(ip) && !self.claimed_by_other(network, ip, mac).await?);

        if leased {
            match self.leases.delete_lease(mac) {
                Ok(_) | Err(DhcpError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if forget_mac && cached == Some(ip) {
            self.forget_mac(network, mac);
        }
        if !owned {
            debug!(network = %network, mac = %mac, %ip, "Address not held by this NIC, nothing to release");
            return Ok(());
        }
        if self.ipam.is_allocated(network, ip) {
            self.ipam.release_ip(network, ip)?;
            info!(network = %network, mac = %mac, %ip, "Released ip");
        }
        self.mirror_pool_status(network, &[Mirror::Remove(ip, mac.to_string())])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_reconciler;

    #[test]
    fn test_retry_after_budget() {
        let (reconciler, _client) = create_test_reconciler();
        let conflict = ControllerError::Cluster(cluster_client::ClusterError::Conflict("ippool".to_string()));

        let delays: Vec<_> = (0..6).map(|_| reconciler.retry_after("IPPool/net-1", &conflict)).collect();
        assert_eq!(delays[0], Some(Duration::from_millis(5)));
        assert_eq!(delays[4], Some(Duration::from_millis(80)));
        assert_eq!(delays[5], None, "dropped once the budget is spent");

        // Budget starts over after being dropped
        assert_eq!(reconciler.retry_after("IPPool/net-1", &conflict), Some(Duration::from_millis(5)));
        reconciler.record_success("IPPool/net-1");
        assert_eq!(reconciler.retry_after("IPPool/net-1", &conflict), Some(Duration::from_millis(5)));

        let invalid = ControllerError::ValidationFailed("bad".to_string());
        assert_eq!(reconciler.retry_after("IPPool/net-1", &invalid), None);
    }
}
