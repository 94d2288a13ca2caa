//! Prometheus gauges for pools and per-NIC allocation state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::MetricsError;

const NAMESPACE: &str = "vmdhcpcontroller";

/// Labels of the latest `_vmnetcfg_status` series per NIC: (ip, status).
type NicSeries = HashMap<(String, String, String), (String, String)>;

/// Gauges exported on `/metrics`.
///
/// Series are tracked by owner so that stale label sets can be removed when
/// an IP or state changes and when the owning object goes away.
pub struct Metrics {
    registry: Registry,
    ippool_used: IntGaugeVec,
    ippool_available: IntGaugeVec,
    vmnetcfg_status: IntGaugeVec,
    pools: Mutex<HashMap<String, (String, String)>>,
    nics: Mutex<NicSeries>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Metrics {
    /// Registers all gauges on a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let pool_labels = &["ippool", "cidr", "network"];

        let ippool_used = IntGaugeVec::new(
            Opts::new("ippool_used", "Number of allocated addresses in the IPPool").namespace(NAMESPACE),
            pool_labels,
        )?;
        let ippool_available = IntGaugeVec::new(
            Opts::new("ippool_available", "Number of free addresses in the IPPool").namespace(NAMESPACE),
            pool_labels,
        )?;
        let vmnetcfg_status = IntGaugeVec::new(
            Opts::new("vmnetcfg_status", "Allocation state of a VM network interface").namespace(NAMESPACE),
            &["vmnetcfg", "network", "mac", "ip", "status"],
        )?;

        registry.register(Box::new(ippool_used.clone()))?;
        registry.register(Box::new(ippool_available.clone()))?;
        registry.register(Box::new(vmnetcfg_status.clone()))?;

        Ok(Self {
            registry,
            ippool_used,
            ippool_available,
            vmnetcfg_status,
            pools: Mutex::new(HashMap::new()),
            nics: Mutex::new(HashMap::new()),
        })
    }

    /// Records pool counters.
    pub fn update_ippool(&self, ippool: &str, cidr: &str, network: &str, used: u32, available: u32) {
        let mut pools = lock(&self.pools);
        let labels = (cidr.to_string(), network.to_string());
        if let Some(previous) = pools.get(ippool).filter(|p| **p != labels) {
            self.remove_pool_series(ippool, previous);
        }
        self.ippool_used
            .with_label_values(&[ippool, cidr, network])
            .set(i64::from(used));
        self.ippool_available
            .with_label_values(&[ippool, cidr, network])
            .set(i64::from(available));
        pools.insert(ippool.to_string(), labels);
    }

    fn remove_pool_series(&self, ippool: &str, (cidr, network): &(String, String)) {
        let values = [ippool, cidr.as_str(), network.as_str()];
        let _ = self.ippool_used.remove_label_values(&values);
        let _ = self.ippool_available.remove_label_values(&values);
    }

    /// Drops the series of a deleted pool.
    pub fn delete_ippool(&self, ippool: &str) {
        if let Some(labels) = lock(&self.pools).remove(ippool) {
            self.remove_pool_series(ippool, &labels);
        }
    }

    /// Records the latest state of one NIC.
    pub fn update_vmnetcfg_status(&self, vmnetcfg: &str, network: &str, mac: &str, ip: &str, status: &str) {
        let mut nics = lock(&self.nics);
        let key = (vmnetcfg.to_string(), network.to_string(), mac.to_string());
        if let Some((old_ip, old_status)) = nics.get(&key) {
            if old_ip != ip || old_status != status {
                let _ = self
                    .vmnetcfg_status
                    .remove_label_values(&[vmnetcfg, network, mac, old_ip.as_str(), old_status.as_str()]);
            }
        }
        self.vmnetcfg_status
            .with_label_values(&[vmnetcfg, network, mac, ip, status])
            .set(1);
        nics.insert(key, (ip.to_string(), status.to_string()));
    }

    /// Drops every NIC series of a deleted VMNetCfg.
    pub fn delete_vmnetcfg(&self, vmnetcfg: &str) {
        lock(&self.nics).retain(|(cfg, network, mac), (ip, status)| {
            if cfg != vmnetcfg {
                return true;
            }
            let _ = self
                .vmnetcfg_status
                .remove_label_values(&[cfg.as_str(), network.as_str(), mac.as_str(), ip.as_str(), status.as_str()]);
            false
        });
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_series_and_cleanup() {
        let m = Metrics::new().unwrap();
        m.update_ippool("net-1", "192.168.0.0/24", "default/net-1", 1, 99);
        let text = m.render().unwrap();
        assert!(text.contains(
            r#"vmdhcpcontroller_ippool_used{cidr="192.168.0.0/24",ippool="net-1",network="default/net-1"} 1"#
        ));
        assert!(text.contains("vmdhcpcontroller_ippool_available"));

        m.delete_ippool("net-1");
        assert!(!m.render().unwrap().contains(r#"ippool="net-1""#));
    }

    #[test]
    fn test_nic_series_follow_state() {
        let m = Metrics::new().unwrap();
        m.update_vmnetcfg_status("default/vm-1", "default/net-1", "aa:bb:cc:dd:ee:01", "", "Pending");
        m.update_vmnetcfg_status(
            "default/vm-1",
            "default/net-1",
            "aa:bb:cc:dd:ee:01",
            "192.168.0.150",
            "Allocated",
        );
        let text = m.render().unwrap();
        assert!(text.contains(r#"status="Allocated""#));
        assert!(!text.contains(r#"status="Pending""#));

        m.delete_vmnetcfg("default/vm-1");
        assert!(!m.render().unwrap().contains("vm-1"));
    }
}
