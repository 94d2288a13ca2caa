//! Lease synchronisation for the pools this agent serves.
//!
//! The controller records every binding in `status.ipv4.allocated` of the
//! IPPool. The agent mirrors the MAC-tagged entries of that map into its
//! lease table, with the options of the pool spec, and keeps one DHCP
//! server running on the interface facing the pool's network.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cluster_client::ClusterClient;
use crds::labels::AGENT_INTERFACE;
use crds::{IPPool, NetworkName, is_sentinel_tag};
use dhcp_server::{DhcpError, DhcpLease, DhcpServerSet};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use metrics_server::AppState;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the lease table equal to the allocation maps of the served pools.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    servers: Arc<DhcpServerSet>,
    config: AgentConfig,
    dry_run: bool,
    state: AppState,
    /// IPPool name -> MACs whose leases were written for that pool
    owned: Mutex<HashMap<String, BTreeSet<String>>>,
    /// IPPool name -> interface and server address being served
    serving: Mutex<HashMap<String, (String, Ipv4Addr)>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler writing into the lease table of `servers`.
    ///
    /// With `dry_run` set the lease table is maintained but no DHCP server
    /// is started.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        servers: Arc<DhcpServerSet>,
        config: AgentConfig,
        dry_run: bool,
        state: AppState,
    ) -> Self {
        Self {
            client,
            servers,
            config,
            dry_run,
            state,
            owned: Mutex::new(HashMap::new()),
            serving: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles one IPPool.
    pub async fn reconcile_ippool(&self, pool: &IPPool) -> Result<Action, AgentError> {
        let name = pool.name_any();
        if !self.config.serves(&name) {
            debug!(ippool = %name, "IPPool not served by this agent");
            return Ok(Action::await_change());
        }
        info!("Reconciling IPPool {}", name);

        if pool.metadata.deletion_timestamp.is_some() {
            self.forget_pool(&name).await;
            return Ok(Action::await_change());
        }

        let desired = self.desired_leases(pool).await?;
        self.apply_leases(&name, &desired)?;
        if self.dry_run {
            debug!(ippool = %name, "Dry run, not starting a DHCP server");
        } else {
            self.ensure_server(pool).await?;
        }

        self.state.set_ready(true);
        Ok(Action::await_change())
    }

    /// `mac -> namespace/vmName` of every NIC on the pool's network.
    async fn lease_references(&self, network: &NetworkName) -> Result<HashMap<String, String>, AgentError> {
        let mut references = HashMap::new();
        for cfg in self.client.list_vmnetcfgs(None).await? {
            let namespace = cfg.namespace().unwrap_or_default();
            for nic in &cfg.spec.network_configs {
                let on_network = NetworkName::parse(&nic.network_name, Some(&namespace))
                    .is_ok_and(|n| &n == network);
                if on_network {
                    references.insert(
                        nic.mac_address.trim().to_ascii_lowercase(),
                        format!("{namespace}/{}", cfg.spec.vm_name),
                    );
                }
            }
        }
        Ok(references)
    }

    /// Leases the pool status asks for, keyed by lowercase MAC.
    async fn desired_leases(&self, pool: &IPPool) -> Result<BTreeMap<String, DhcpLease>, AgentError> {
        let network = pool
            .network()
            .map_err(|e| DhcpError::InvalidPool(e.to_string()))?;
        let references = self.lease_references(&network).await?;

        let mut desired = BTreeMap::new();
        for (ip, tag) in pool.allocated() {
            if is_sentinel_tag(&tag) {
                continue;
            }
            let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                warn!(ippool = %pool.name_any(), ip = %ip, "Skipping malformed address in pool status");
                continue;
            };
            let mac = tag.trim().to_ascii_lowercase();
            let reference = references.get(&mac).map_or("", String::as_str);
            desired.insert(mac, DhcpLease::for_pool(pool, ip, reference)?);
        }
        Ok(desired)
    }

    /// Makes the leases owned by `name` equal to `desired`.
    fn apply_leases(&self, name: &str, desired: &BTreeMap<String, DhcpLease>) -> Result<(), AgentError> {
        let leases = self.servers.leases();
        let previous = lock(&self.owned).insert(name.to_string(), desired.keys().cloned().collect());

        for mac in previous.iter().flatten().filter(|m| !desired.contains_key(*m)) {
            match leases.delete_lease(mac) {
                Ok(lease) => info!(ippool = %name, mac = %mac, ip = %lease.client_ip, "Removed lease"),
                Err(DhcpError::NotFound(_)) => {}
                Err(e) => warn!(ippool = %name, mac = %mac, error = %e, "Failed to remove lease"),
            }
        }

        for (mac, lease) in desired {
            match leases.get_lease(mac) {
                Some(current) if current == *lease => continue,
                Some(_) => {
                    if let Err(e) = leases.delete_lease(mac) {
                        debug!(ippool = %name, mac = %mac, error = %e, "Stale lease already gone");
                    }
                }
                None => {}
            }
            leases.add_lease(mac, lease.clone())?;
            info!(ippool = %name, mac = %mac, ip = %lease.client_ip, reference = %lease.reference, "Synced lease");
        }
        Ok(())
    }

    /// Starts, or restarts on change, the server facing the pool's network.
    async fn ensure_server(&self, pool: &IPPool) -> Result<(), AgentError> {
        let name = pool.name_any();
        let parsed = pool
            .spec
            .ipv4
            .parse()
            .map_err(|e| DhcpError::InvalidPool(e.to_string()))?;
        let Some(server_ip) = parsed.server_ip else {
            warn!(ippool = %name, "IPPool has no serverIP, not serving");
            return Ok(());
        };
        let network = pool
            .network()
            .map_err(|e| DhcpError::InvalidPool(e.to_string()))?;
        let nic = self.config.interface_for(&network).unwrap_or(AGENT_INTERFACE);

        let wanted = (nic.to_string(), server_ip);
        let current = lock(&self.serving).get(&name).cloned();
        if current.as_ref() == Some(&wanted) && self.servers.is_running(nic) {
            return Ok(());
        }
        if let Some((old_nic, _)) = current {
            info!(ippool = %name, nic = %old_nic, "Restarting DHCP server");
            self.servers.stop(&old_nic).await;
        }
        self.servers.run(nic, server_ip)?;
        info!(ippool = %name, nic = %nic, server_ip = %server_ip, "Serving DHCP");
        lock(&self.serving).insert(name, wanted);
        Ok(())
    }

    /// Drops every lease and the server of a pool being deleted.
    async fn forget_pool(&self, name: &str) {
        info!(ippool = %name, "IPPool is being deleted, dropping its leases");
        let leases = self.servers.leases();
        for mac in lock(&self.owned).remove(name).unwrap_or_default() {
            match leases.delete_lease(&mac) {
                Ok(_) | Err(DhcpError::NotFound(_)) => {}
                Err(e) => warn!(ippool = %name, mac = %mac, error = %e, "Failed to remove lease"),
            }
        }
        let serving = lock(&self.serving).remove(name);
        if let Some((nic, _)) = serving {
            self.servers.stop(&nic).await;
        }
    }
}
