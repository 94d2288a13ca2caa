//! IPPool reconciliation.
//!
//! Installs the pool's subnet into the allocator, rebuilds the MAC index
//! from `status.ipv4.allocated`, keeps exactly one agent pod per pool and
//! maintains the Registered/CacheReady/AgentReady/Ready/Disabled conditions.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::Utc;
use crds::labels::{FINALIZER, agent_selector_for};
use crds::{
    ConditionType, EXCLUDED_TAG, IPPool, IPPoolStatus, IPv4Status, ParsedIPv4Config, PodReference,
    RESERVED_TAG, is_sentinel_tag, set_condition,
};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use super::Reconciler;
use super::agent::{build_agent_pod, has_drifted, is_pod_ready, pod_reference};
use crate::error::ControllerError;

/// What the agent pod of a pool looks like right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AgentState {
    /// One pod, Ready
    Ready(PodReference),
    /// One pod, not Ready yet
    Starting(PodReference),
    /// The pod was out of date and has been deleted
    Recreating,
    /// More than one agent pod matches the pool
    Misconfigured(usize),
    /// No server address to run an agent with
    NoServerIp,
}

/// Pool range, defaulting to `[network + 1, broadcast - 1]`.
pub fn pool_range(parsed: &ParsedIPv4Config) -> (Ipv4Addr, Ipv4Addr) {
    let start = parsed
        .start
        .unwrap_or_else(|| Ipv4Addr::from(u32::from(parsed.network()).saturating_add(1)));
    let end = parsed
        .end
        .unwrap_or_else(|| Ipv4Addr::from(u32::from(parsed.broadcast()).saturating_sub(1)));
    (start, end)
}

/// Addresses that must stay unallocatable, with their status tag.
///
/// Excludes are tagged `EXCLUDED`; the server address and the router are
/// `RESERVED`. Addresses outside the CIDR are ignored.
pub fn sentinel_addresses(parsed: &ParsedIPv4Config) -> BTreeMap<Ipv4Addr, &'static str> {
    let mut tags: BTreeMap<Ipv4Addr, &'static str> =
        parsed.exclude.iter().map(|ip| (*ip, EXCLUDED_TAG)).collect();
    for ip in parsed.server_ip.iter().chain(parsed.router.iter()) {
        tags.insert(*ip, RESERVED_TAG);
    }
    tags.retain(|ip, _| parsed.cidr.contains(ip) && *ip != parsed.broadcast());
    tags
}

fn has_finalizer<K: ResourceExt>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

impl Reconciler {
    /// Reconciles one IPPool.
    pub async fn reconcile_ippool(&self, pool: &IPPool) -> Result<Action, ControllerError> {
        let name = pool.name_any();
        info!("Reconciling IPPool {}", name);

        if pool.metadata.deletion_timestamp.is_some() {
            self.cleanup_ippool(pool).await?;
            return Ok(Action::await_change());
        }

        let pool = if has_finalizer(pool) {
            pool.clone()
        } else {
            let mut finalizers = pool.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.client.set_ippool_finalizers(pool, finalizers).await?
        };

        let mut status = pool.status.clone().unwrap_or_default();

        let parsed = match pool.spec.ipv4.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(ippool = %name, error = %e, "Invalid IPPool spec");
                set_condition(&mut status.conditions, ConditionType::Registered, false, "InvalidSpec", &e.to_string());
                set_condition(&mut status.conditions, ConditionType::Ready, false, "InvalidSpec", "");
                self.write_ippool_status(&pool, &status).await?;
                return Err(ControllerError::ValidationFailed(format!("ippool {name}: {e}")));
            }
        };

        if pool.is_paused() {
            info!(ippool = %name, "IPPool is paused");
            set_condition(&mut status.conditions, ConditionType::Disabled, true, "Paused", "");
            set_condition(&mut status.conditions, ConditionType::Ready, false, "Paused", "");
            self.write_ippool_status(&pool, &status).await?;
            return Ok(Action::await_change());
        }
        set_condition(&mut status.conditions, ConditionType::Disabled, false, "", "");

        let ipv4 = match self.install_subnet(&pool, &parsed, false) {
            Ok(ipv4) => ipv4,
            Err(e) => {
                warn!(ippool = %name, error = %e, "Failed to install subnet");
                set_condition(&mut status.conditions, ConditionType::Registered, false, "SubnetInstallFailed", &e.to_string());
                set_condition(&mut status.conditions, ConditionType::Ready, false, "SubnetInstallFailed", "");
                self.write_ippool_status(&pool, &status).await?;
                return Err(e);
            }
        };
        set_condition(&mut status.conditions, ConditionType::Registered, true, "", "");
        set_condition(&mut status.conditions, ConditionType::CacheReady, true, "", "");
        if status.ipv4.as_ref() != Some(&ipv4) {
            status.ipv4 = Some(ipv4);
            status.last_update = Some(Utc::now());
        }

        let agent = self.ensure_agent(&pool, &parsed).await?;
        let (agent_ready, reason, message) = match &agent {
            AgentState::Ready(_) => (true, String::new(), String::new()),
            AgentState::Starting(pod) => (
                false,
                "AgentNotReady".to_string(),
                format!("waiting for agent pod {}/{} to become ready", pod.namespace, pod.name),
            ),
            AgentState::Recreating => (false, "AgentOutdated".to_string(), "recreating agent pod".to_string()),
            AgentState::Misconfigured(n) => (
                false,
                "AgentMisconfigured".to_string(),
                format!("{n} agent pods found, expected exactly one"),
            ),
            AgentState::NoServerIp => (false, "ServerIPMissing".to_string(), "serverIP is not set".to_string()),
        };
        status.agent_pod_ref = match agent {
            AgentState::Ready(pod) | AgentState::Starting(pod) => Some(pod),
            _ => None,
        };
        set_condition(&mut status.conditions, ConditionType::AgentReady, agent_ready, &reason, &message);
        if agent_ready {
            set_condition(&mut status.conditions, ConditionType::Ready, true, "", "");
        } else {
            set_condition(&mut status.conditions, ConditionType::Ready, false, &reason, &message);
        }

        let written = self.write_ippool_status(&pool, &status).await?;
        self.record_pool_metrics(&written);
        Ok(Action::await_change())
    }

    async fn write_ippool_status(&self, pool: &IPPool, status: &IPPoolStatus) -> Result<IPPool, ControllerError> {
        if pool.status.as_ref() == Some(status) {
            return Ok(pool.clone());
        }
        debug!(ippool = %pool.name_any(), "Writing IPPool status");
        Ok(self.client.update_ippool_status(pool, status).await?)
    }

    /// Brings the allocator and MAC index in line with the pool.
    ///
    /// The subnet is recreated and the MAC-tagged entries of
    /// `status.ipv4.allocated` replayed into it when `force` is set, when
    /// the CIDR or range changed, or when the revoked addresses differ from
    /// the pool's excludes and reserved addresses. Returns the status the
    /// pool should carry afterwards.
    pub(crate) fn install_subnet(
        &self,
        pool: &IPPool,
        parsed: &ParsedIPv4Config,
        force: bool,
    ) -> Result<IPv4Status, ControllerError> {
        let network = pool.network_key();
        let network = network.as_str();
        let cidr = parsed.cidr.to_string();
        let (start, end) = pool_range(parsed);

        let bound: BTreeMap<Ipv4Addr, String> = pool
            .allocated()
            .into_iter()
            .filter(|(_, tag)| !is_sentinel_tag(tag))
            .filter_map(|(ip, mac)| ip.parse().ok().map(|ip| (ip, mac)))
            .collect();
        let mut sentinels = sentinel_addresses(parsed);
        sentinels.retain(|ip, _| !bound.contains_key(ip));

        let rebuild = force
            || !self.ipam.subnet_matches(network, &cidr, start, end)
            || self.ipam.revoked(network) != sentinels.keys().copied().collect::<BTreeSet<_>>();
        if rebuild {
            self.ipam.new_subnet(network, &cidr, start, end)?;
            self.cache.delete_mac_set(network);
            self.cache.new_mac_set(network);
            for ip in sentinels.keys() {
                self.ipam.revoke_ip(network, *ip)?;
            }
            for (ip, mac) in &bound {
                let replayed = self
                    .ipam
                    .allocate_ip(network, *ip)
                    .and_then(|_| self.cache.add_mac(network, mac, *ip));
                if let Err(e) = replayed {
                    warn!(network = %network, %ip, mac = %mac, error = %e, "Failed to replay allocation");
                }
            }
            info!(network = %network, %cidr, %start, %end, replayed = bound.len(), "Rebuilt allocator state from IPPool");
        } else {
            self.cache.new_mac_set(network);
        }

        let mut allocated: BTreeMap<String, String> = sentinels
            .iter()
            .map(|(ip, tag)| (ip.to_string(), (*tag).to_string()))
            .collect();
        for (ip, mac) in bound {
            if self.ipam.is_allocated(network, ip) {
                allocated.insert(ip.to_string(), mac);
            }
        }
        let mut ipv4 = IPv4Status {
            allocated,
            ..Default::default()
        };
        self.refresh_counters(network, &mut ipv4);
        Ok(ipv4)
    }

    /// Keeps exactly one up-to-date agent pod for the pool.
    pub(crate) async fn ensure_agent(&self, pool: &IPPool, parsed: &ParsedIPv4Config) -> Result<AgentState, ControllerError> {
        if parsed.server_ip.is_none() {
            return Ok(AgentState::NoServerIp);
        }
        let name = pool.name_any();
        let expected = build_agent_pod(pool, parsed, &self.agent)?;
        let pods = self
            .client
            .list_pods(&self.agent.namespace, &agent_selector_for(&name))
            .await?;

        match pods.as_slice() {
            [] => {
                let created = self.client.create_pod(&expected).await?;
                info!(ippool = %name, pod = %created.name_any(), "Created agent pod");
                Ok(AgentState::Starting(pod_reference(&created)))
            }
            [pod] if has_drifted(pod, &expected) => {
                info!(ippool = %name, pod = %pod.name_any(), "Agent pod is outdated, deleting");
                self.client
                    .delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                    .await?;
                Ok(AgentState::Recreating)
            }
            [pod] if is_pod_ready(pod) => Ok(AgentState::Ready(pod_reference(pod))),
            [pod] => Ok(AgentState::Starting(pod_reference(pod))),
            many => {
                warn!(ippool = %name, count = many.len(), "Multiple agent pods found for IPPool");
                Ok(AgentState::Misconfigured(many.len()))
            }
        }
    }

    /// Rebuilds the allocator state of every active pool from its status.
    ///
    /// Runs once, before any watcher starts. `lastUpdateBeforeStart` records
    /// the previous `lastUpdate` so that configs created while no controller
    /// was running can be told apart.
    pub async fn startup_replay(&self) -> Result<(), ControllerError> {
        let pools = self.client.list_ippools().await?;
        info!(count = pools.len(), "Replaying IPPool status into allocators");

        for pool in pools {
            let name = pool.name_any();
            if pool.metadata.deletion_timestamp.is_some() || pool.is_paused() {
                continue;
            }
            let parsed = match pool.spec.ipv4.parse() {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(ippool = %name, error = %e, "Skipping replay of invalid IPPool");
                    continue;
                }
            };
            let ipv4 = match self.install_subnet(&pool, &parsed, true) {
                Ok(ipv4) => ipv4,
                Err(e) => {
                    warn!(ippool = %name, error = %e, "Failed to replay IPPool");
                    continue;
                }
            };

            let now = Utc::now();
            self.mark_replayed(&pool.network_key(), now);
            self.update_pool_status_with_retry(&name, |status| {
                status.last_update_before_start = status.last_update;
                status.last_update = Some(now);
                status.ipv4 = Some(ipv4.clone());
                set_condition(&mut status.conditions, ConditionType::Registered, true, "", "");
                set_condition(&mut status.conditions, ConditionType::CacheReady, true, "", "");
            })
            .await?;
        }
        Ok(())
    }

    /// Tears down everything a deleted pool owned, then drops the finalizer.
    async fn cleanup_ippool(&self, pool: &IPPool) -> Result<(), ControllerError> {
        let name = pool.name_any();
        let network = pool.network_key();
        let network = network.as_str();
        info!(ippool = %name, "Cleaning up deleted IPPool");

        for pod in self
            .client
            .list_pods(&self.agent.namespace, &agent_selector_for(&name))
            .await?
        {
            self.client
                .delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                .await?;
        }

        let macs = self.cache.list_all(Some(network)).remove(network).unwrap_or_default();
        for (mac, ip) in macs {
            let held = self
                .leases
                .get_lease(&mac)
                .is_some_and(|l| l.client_ip.to_string() == ip);
            if held {
                if let Err(e) = self.leases.delete_lease(&mac) {
                    debug!(ippool = %name, mac = %mac, error = %e, "Lease already gone");
                }
            }
        }
        self.ipam.delete_subnet(network);
        self.cache.delete_mac_set(network);
        self.forget_replay(network);
        self.metrics.delete_ippool(&name);

        if has_finalizer(pool) {
            let finalizers = pool
                .finalizers()
                .iter()
                .filter(|f| *f != FINALIZER)
                .cloned()
                .collect();
            self.client.set_ippool_finalizers(pool, finalizers).await?;
        }
        Ok(())
    }
}
