//! VirtualMachineNetworkConfig reconciliation.
//!
//! Allocates one address per NIC from the pool of its network, binds a
//! lease to the NIC's MAC and mirrors the binding into the pool status.

use std::net::Ipv4Addr;
use std::time::Duration;

use crds::labels::FINALIZER;
use crds::time::to_utc;
use crds::{
    ConditionType, IPPool, NetworkConfig, NetworkConfigState, NetworkConfigStatus, NetworkName, VirtualMachineNetworkConfig,
    VirtualMachineNetworkConfigStatus, get_condition, set_condition,
};
use dhcp_server::DhcpLease;
use ipam::IpamError;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use super::{Mirror, Reconciler};
use crate::error::ControllerError;

/// `InSynced=False` reason owned by the VM deriver while removed NICs are
/// waiting to be released.
pub const NETWORK_CONFIG_CHANGED: &str = "NetworkConfigChanged";

/// Requeue delay while a NIC waits for its pool.
const PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Result of processing one NIC.
struct NicOutcome {
    status: NetworkConfigStatus,
    retry: bool,
}

impl NicOutcome {
    fn new(nc: &NetworkConfig, state: NetworkConfigState, ip: Option<Ipv4Addr>, message: Option<String>) -> Self {
        Self {
            status: NetworkConfigStatus {
                allocated_ip_address: ip.map(|ip| ip.to_string()),
                mac_address: nc.mac_address.clone(),
                network_name: nc.network_name.clone(),
                state,
                message,
            },
            retry: false,
        }
    }

    fn allocated(nc: &NetworkConfig, ip: Ipv4Addr) -> Self {
        Self::new(nc, NetworkConfigState::Allocated, Some(ip), None)
    }

    fn error(nc: &NetworkConfig, message: impl Into<String>) -> Self {
        Self::new(nc, NetworkConfigState::Error, None, Some(message.into()))
    }

    fn pending(nc: &NetworkConfig, ip: Option<Ipv4Addr>, message: &str) -> Self {
        let mut outcome = Self::new(nc, NetworkConfigState::Pending, ip, Some(message.to_string()));
        outcome.retry = true;
        outcome
    }
}

fn same_nic(status: &NetworkConfigStatus, mac: &str, network: &str) -> bool {
    status.mac_address.eq_ignore_ascii_case(mac) && status.network_name == network
}

fn parse_ip(raw: Option<&str>) -> Option<Ipv4Addr> {
    raw.and_then(|ip| ip.trim().parse().ok())
}

/// Canonical `namespace/name` of a NIC's network. Bare names resolve into
/// the config's namespace.
pub(crate) fn nic_network(cfg: &VirtualMachineNetworkConfig, network: &str) -> String {
    let namespace = cfg.namespace();
    NetworkName::parse(network, namespace.as_deref())
        .map_or_else(|_| network.to_string(), |n| n.to_string())
}

/// `namespace/vmName` recorded as the lease reference.
pub fn lease_reference(cfg: &VirtualMachineNetworkConfig) -> String {
    format!("{}/{}", cfg.namespace().unwrap_or_default(), cfg.spec.vm_name)
}

/// Whether the VM deriver is waiting for removed NICs to be released.
pub fn network_config_changed(cfg: &VirtualMachineNetworkConfig) -> bool {
    cfg.status
        .as_ref()
        .and_then(|s| get_condition(&s.conditions, ConditionType::InSynced))
        .is_some_and(|c| {
            c.status == crds::ConditionStatus::False && c.reason.as_deref() == Some(NETWORK_CONFIG_CHANGED)
        })
}

impl Reconciler {
    /// Reconciles one VirtualMachineNetworkConfig.
    pub async fn reconcile_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<Action, ControllerError> {
        let key = format!("{}/{}", cfg.namespace().unwrap_or_default(), cfg.name_any());
        info!("Reconciling VirtualMachineNetworkConfig {}", key);

        if cfg.metadata.deletion_timestamp.is_some() {
            self.cleanup_vmnetcfg(cfg).await?;
            return Ok(Action::await_change());
        }

        let cfg = if cfg.finalizers().iter().any(|f| f == FINALIZER) {
            cfg.clone()
        } else {
            let mut finalizers = cfg.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.client.set_vmnetcfg_finalizers(cfg, finalizers).await?
        };
        let reference = lease_reference(&cfg);
        let mut status = cfg.status.clone().unwrap_or_default();

        // NICs that left the spec give up what they held
        let in_spec = |s: &NetworkConfigStatus| {
            cfg.spec
                .network_configs
                .iter()
                .any(|nc| same_nic(s, &nc.mac_address, &nc.network_name))
        };
        for stale in status.network_configs.iter().filter(|s| !in_spec(s)) {
            let ip = parse_ip(stale.allocated_ip_address.as_deref());
            let network = nic_network(&cfg, &stale.network_name);
            self.release_nic(&reference, &network, &stale.mac_address, ip, true)
                .await?;
        }
        status.network_configs.retain(|s| in_spec(s));

        let mut retry = false;
        if cfg.is_paused() {
            self.pause_vmnetcfg(&cfg, &reference, &mut status).await?;
        } else {
            let mut entries = Vec::with_capacity(cfg.spec.network_configs.len());
            for nc in &cfg.spec.network_configs {
                let prior = status
                    .network_configs
                    .iter()
                    .find(|s| same_nic(s, &nc.mac_address, &nc.network_name));
                let outcome = self.allocate_nic(&cfg, &reference, nc, prior).await?;
                retry |= outcome.retry;
                entries.push(outcome.status);
            }
            status.network_configs = entries;
            self.finalize_conditions(&cfg, &mut status, false);
        }

        self.record_nic_metrics(&key, &status);
        self.write_vmnetcfg_status(&cfg, &status).await?;
        if retry {
            Ok(Action::requeue(PENDING_REQUEUE))
        } else {
            Ok(Action::await_change())
        }
    }

    /// Releases every allocated NIC, keeping its address on record.
    async fn pause_vmnetcfg(
        &self,
        cfg: &VirtualMachineNetworkConfig,
        reference: &str,
        status: &mut VirtualMachineNetworkConfigStatus,
    ) -> Result<(), ControllerError> {
        info!(vmnetcfg = %cfg.name_any(), "VirtualMachineNetworkConfig is paused, releasing addresses");
        let mut entries = Vec::with_capacity(cfg.spec.network_configs.len());
        for nc in &cfg.spec.network_configs {
            let prior = status
                .network_configs
                .iter()
                .find(|s| same_nic(s, &nc.mac_address, &nc.network_name));
            let ip = prior.and_then(|p| parse_ip(p.allocated_ip_address.as_deref()));
            if prior.is_some_and(|p| p.state == NetworkConfigState::Allocated) {
                let network = nic_network(cfg, &nc.network_name);
                self.release_nic(reference, &network, &nc.mac_address, ip, false)
                    .await?;
            }
            entries.push(NetworkConfigStatus {
                allocated_ip_address: ip.map(|ip| ip.to_string()),
                mac_address: nc.mac_address.clone(),
                network_name: nc.network_name.clone(),
                state: NetworkConfigState::Pending,
                message: None,
            });
        }
        status.network_configs = entries;
        self.finalize_conditions(cfg, status, true);
        Ok(())
    }

    fn finalize_conditions(
        &self,
        cfg: &VirtualMachineNetworkConfig,
        status: &mut VirtualMachineNetworkConfigStatus,
        paused: bool,
    ) {
        let conditions = &mut status.conditions;
        let failed = status
            .network_configs
            .iter()
            .filter(|s| s.state == NetworkConfigState::Error)
            .count();
        let all_allocated = status
            .network_configs
            .iter()
            .all(|s| s.state == NetworkConfigState::Allocated);

        if paused {
            set_condition(conditions, ConditionType::Allocated, false, "Paused", "");
        } else if all_allocated {
            set_condition(conditions, ConditionType::Allocated, true, "", "");
        } else if failed > 0 {
            set_condition(
                conditions,
                ConditionType::Allocated,
                false,
                "AllocationFailed",
                &format!("{failed} network interface(s) in error"),
            );
        } else {
            set_condition(conditions, ConditionType::Allocated, false, "AllocationPending", "");
        }

        if !network_config_changed(cfg) {
            let synced = cfg.spec.network_configs.iter().all(|nc| {
                status
                    .network_configs
                    .iter()
                    .any(|s| same_nic(s, &nc.mac_address, &nc.network_name))
            });
            set_condition(conditions, ConditionType::InSynced, synced, "", "");
        }
        set_condition(conditions, ConditionType::Disabled, paused, if paused { "Paused" } else { "" }, "");
    }

    fn record_nic_metrics(&self, key: &str, status: &VirtualMachineNetworkConfigStatus) {
        for s in &status.network_configs {
            self.metrics.update_vmnetcfg_status(
                key,
                &s.network_name,
                &s.mac_address,
                s.allocated_ip_address.as_deref().unwrap_or_default(),
                s.state.as_str(),
            );
        }
    }

    async fn write_vmnetcfg_status(
        &self,
        cfg: &VirtualMachineNetworkConfig,
        status: &VirtualMachineNetworkConfigStatus,
    ) -> Result<(), ControllerError> {
        if cfg.status.as_ref() == Some(status) {
            return Ok(());
        }
        debug!(vmnetcfg = %cfg.name_any(), "Writing VirtualMachineNetworkConfig status");
        self.client.update_vmnetcfg_status(cfg, status).await?;
        Ok(())
    }

    /// Whether `cfg` was created after the last status write of the pool's
    /// previous controller and before this process rebuilt its state.
    fn created_during_downtime(&self, pool: &IPPool, cfg: &VirtualMachineNetworkConfig) -> bool {
        let Some(before) = pool.status.as_ref().and_then(|s| s.last_update_before_start) else {
            return false;
        };
        let Some(replayed) = self.replayed_at(&pool.network_key()) else {
            return false;
        };
        let Some(created) = cfg.metadata.creation_timestamp.as_ref().and_then(to_utc) else {
            return false;
        };
        created > before && created < replayed
    }

    async fn allocate_nic(
        &self,
        cfg: &VirtualMachineNetworkConfig,
        reference: &str,
        nc: &NetworkConfig,
        prior: Option<&NetworkConfigStatus>,
    ) -> Result<NicOutcome, ControllerError> {
        let mac = nc.mac_address.as_str();

        let hint = match nc.ip_address.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => match raw.parse::<Ipv4Addr>() {
                Ok(ip) => Some(ip),
                Err(_) => return Ok(NicOutcome::error(nc, format!("invalid ip address {raw}"))),
            },
            None => None,
        };
        let prior_ip = prior.and_then(|p| parse_ip(p.allocated_ip_address.as_deref()));
        let prior_allocated = prior
            .filter(|p| p.state == NetworkConfigState::Allocated)
            .and(prior_ip);

        let Some(pool) = self.find_ippool(&nic_network(cfg, &nc.network_name)).await? else {
            return Ok(NicOutcome::error(nc, "ippool not found"));
        };
        let network = pool.network_key();
        let network = network.as_str();
        if pool.is_paused() {
            return Ok(NicOutcome::pending(nc, prior_ip, "ippool is paused"));
        }
        if !self.ipam.has_subnet(network) {
            return Ok(NicOutcome::pending(nc, prior_ip, "ippool is not ready"));
        }

        if let Some(lease) = self.leases.get_lease(mac) {
            if lease.reference != reference {
                warn!(mac = %mac, owner = %lease.reference, "MAC already leased to another VM");
                return Ok(NicOutcome::error(nc, "mac belongs to another VM"));
            }
        }

        let cached = self.cache.get_ip_by_mac(network, mac).ok();

        // Fast path: an allocated NIC keeps its address, whatever it asks for now
        if let Some(ip) = prior_allocated {
            let unchanged = cached == Some(ip) && self.ipam.is_allocated(network, ip);
            if unchanged {
                if let Err(message) = self.bind_lease(&pool, mac, ip, reference) {
                    return Ok(NicOutcome::error(nc, message));
                }
                if pool.allocated().get(&ip.to_string()).is_none_or(|tag| !tag.eq_ignore_ascii_case(mac)) {
                    self.mirror_pool_status(network, &[Mirror::Add(ip, mac.to_string())])
                        .await?;
                }
                return Ok(NicOutcome::allocated(nc, ip));
            }
        }

        if cached.is_none() && self.created_during_downtime(&pool, cfg) {
            warn!(vmnetcfg = %cfg.name_any(), mac = %mac, "Refusing allocation for config created during downtime");
            return Ok(NicOutcome::error(nc, "created during downtime, potential ip hijack"));
        }

        // The MAC index wins over the requested address
        let wanted = cached.or(hint).or(prior_ip);
        // The MAC index survives a pause, so the address may have moved on
        let already_ours = wanted.is_some_and(|w| {
            cached == Some(w)
                && self.ipam.is_allocated(network, w)
                && !pool.allocated().get(&w.to_string()).is_some_and(|tag| !tag.eq_ignore_ascii_case(mac))
        });
        let (ip, fresh) = if let Some(w) = wanted.filter(|_| already_ours) {
            (w, false)
        } else {
            let attempt = self.ipam.allocate_ip(network, wanted.unwrap_or(Ipv4Addr::UNSPECIFIED));
            let attempt = match attempt {
                // A recovered address taken by someone else falls back to
                // the requested one, or to any
                Err(IpamError::Unavailable(_)) if wanted != hint => {
                    if cached.is_some() {
                        self.forget_mac(network, mac);
                    }
                    self.ipam.allocate_ip(network, hint.unwrap_or(Ipv4Addr::UNSPECIFIED))
                }
                other => other,
            };
            match attempt {
                Ok(ip) => (ip, true),
                Err(IpamError::Unavailable(ip)) => {
                    debug!(network = %network, %ip, mac = %mac, "Requested ip already allocated");
                    return Ok(NicOutcome::error(nc, "requested ip already allocated"));
                }
                Err(IpamError::Exhausted(_)) => return Ok(NicOutcome::error(nc, "pool exhausted")),
                Err(IpamError::OutOfRange(ip)) => {
                    return Ok(NicOutcome::error(nc, format!("ip {ip} is out of range")));
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Give up the previous address before committing the new one
        if let Some(old) = prior_allocated.filter(|old| *old != ip) {
            info!(network = %network, mac = %mac, %old, new = %ip, "NIC address changed");
            self.release_nic(reference, network, mac, Some(old), true).await?;
        }

        if let Err(message) = self.bind_lease(&pool, mac, ip, reference) {
            if fresh {
                self.release_address(network, ip);
            }
            return Ok(NicOutcome::error(nc, message));
        }

        match self.cache.get_ip_by_mac(network, mac) {
            Ok(current) if current == ip => {}
            Ok(_) => {
                self.forget_mac(network, mac);
                self.cache.add_mac(network, mac, ip)?;
            }
            Err(_) => self.cache.add_mac(network, mac, ip)?,
        }

        self.mirror_pool_status(network, &[Mirror::Add(ip, mac.to_string())])
            .await?;
        info!(network = %network, mac = %mac, %ip, reference = %reference, "Allocated ip");
        Ok(NicOutcome::allocated(nc, ip))
    }

    /// Makes the lease of `mac` match `ip` and the pool's options.
    ///
    /// Fails with a status message when the pool cannot produce a lease or
    /// the MAC is leased to someone else.
    fn bind_lease(&self, pool: &IPPool, mac: &str, ip: Ipv4Addr, reference: &str) -> Result<(), String> {
        let lease = DhcpLease::for_pool(pool, ip, reference).map_err(|e| e.to_string())?;
        match self.leases.get_lease(mac) {
            Some(existing) if existing == lease => return Ok(()),
            Some(existing) if existing.reference == reference => {
                if let Err(e) = self.leases.delete_lease(mac) {
                    debug!(mac = %mac, error = %e, "Lease already gone");
                }
            }
            Some(_) => return Err("mac belongs to another VM".to_string()),
            None => {}
        }
        self.leases.add_lease(mac, lease).map_err(|e| e.to_string())
    }

    /// Releases every NIC of a deleted config, then drops the finalizer.
    async fn cleanup_vmnetcfg(&self, cfg: &VirtualMachineNetworkConfig) -> Result<(), ControllerError> {
        let key = format!("{}/{}", cfg.namespace().unwrap_or_default(), cfg.name_any());
        info!(vmnetcfg = %key, "Cleaning up deleted VirtualMachineNetworkConfig");
        let reference = lease_reference(cfg);

        for s in cfg.status_network_configs() {
            let ip = parse_ip(s.allocated_ip_address.as_deref());
            let network = nic_network(cfg, &s.network_name);
            self.release_nic(&reference, &network, &s.mac_address, ip, true)
                .await?;
        }
        self.metrics.delete_vmnetcfg(&key);

        if cfg.finalizers().iter().any(|f| f == FINALIZER) {
            let finalizers = cfg
                .finalizers()
                .iter()
                .filter(|f| *f != FINALIZER)
                .cloned()
                .collect();
            self.client.set_vmnetcfg_finalizers(cfg, finalizers).await?;
        }
        Ok(())
    }
}
