//! MAC → lease table.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};

use crds::IPPool;
use eui48::MacAddress;
use serde::Serialize;
use tracing::debug;

use crate::error::DhcpError;

/// DHCP binding handed to one MAC. Options are fixed at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpLease {
    /// Server identifier
    #[serde(rename = "serverIP")]
    pub server_ip: Ipv4Addr,
    /// Address handed to the client
    #[serde(rename = "clientIP")]
    pub client_ip: Ipv4Addr,
    /// Subnet mask option
    pub subnet_mask: Ipv4Addr,
    /// Router option
    pub router: Option<Ipv4Addr>,
    /// DNS servers option
    pub dns: Vec<Ipv4Addr>,
    /// Domain name option
    pub domain_name: Option<String>,
    /// Domain search option
    pub domain_search: Vec<String>,
    /// NTP servers option
    pub ntp: Vec<Ipv4Addr>,
    /// Lease time in seconds
    pub lease_time: u32,
    /// Owner of the binding, `namespace/name`
    pub reference: String,
}

impl DhcpLease {
    /// Lease for `client_ip` carrying the options of `pool`.
    pub fn for_pool(pool: &IPPool, client_ip: Ipv4Addr, reference: &str) -> Result<Self, DhcpError> {
        let ipv4 = &pool.spec.ipv4;
        let parsed = ipv4
            .parse()
            .map_err(|e| DhcpError::InvalidPool(e.to_string()))?;
        let server_ip = parsed
            .server_ip
            .ok_or_else(|| DhcpError::InvalidPool(format!("{}: serverIP is not set", pool.network_name())))?;
        Ok(Self {
            server_ip,
            client_ip,
            subnet_mask: parsed.netmask(),
            router: parsed.router,
            dns: parsed.dns,
            domain_name: ipv4.domain_name.clone(),
            domain_search: ipv4.domain_search.clone(),
            ntp: parsed.ntp,
            lease_time: ipv4.lease_time_or_default(),
            reference: reference.to_string(),
        })
    }
}

/// Parses a 48-bit EUI in any notation `eui48` accepts.
pub fn parse_mac(mac: &str) -> Result<MacAddress, DhcpError> {
    let trimmed = mac.trim();
    if trimmed.is_empty() {
        return Err(DhcpError::InvalidMac(mac.to_string()));
    }
    MacAddress::parse_str(trimmed).map_err(|_| DhcpError::InvalidMac(mac.to_string()))
}

/// Lease table read by the packet server and written by reconcilers.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: RwLock<HashMap<MacAddress, DhcpLease>>,
}

impl LeaseTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `lease` to `mac`.
    pub fn add_lease(&self, mac: &str, lease: DhcpLease) -> Result<(), DhcpError> {
        let key = parse_mac(mac)?;
        let mut leases = self.leases.write().unwrap_or_else(PoisonError::into_inner);
        if leases.contains_key(&key) {
            return Err(DhcpError::AlreadyExists(key.to_hex_string()));
        }
        debug!(mac = %key.to_hex_string(), ip = %lease.client_ip, reference = %lease.reference, "Added lease");
        leases.insert(key, lease);
        Ok(())
    }

    /// Removes the lease bound to `mac`.
    pub fn delete_lease(&self, mac: &str) -> Result<DhcpLease, DhcpError> {
        let key = parse_mac(mac)?;
        let removed = self
            .leases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .ok_or_else(|| DhcpError::NotFound(key.to_hex_string()))?;
        debug!(mac = %key.to_hex_string(), ip = %removed.client_ip, "Deleted lease");
        Ok(removed)
    }

    /// Lease bound to `mac`, if any.
    pub fn get_lease(&self, mac: &str) -> Option<DhcpLease> {
        let key = parse_mac(mac).ok()?;
        self.lookup(key)
    }

    /// Lease bound to a parsed hardware address.
    pub fn lookup(&self, mac: MacAddress) -> Option<DhcpLease> {
        self.leases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mac)
            .cloned()
    }

    /// Whether a lease is bound to `mac`.
    pub fn check_lease(&self, mac: &str) -> bool {
        parse_mac(mac).is_ok_and(|key| {
            self.leases
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&key)
        })
    }

    /// Leases keyed by colon-separated MAC, optionally restricted to one reference.
    pub fn list_all(&self, reference: Option<&str>) -> BTreeMap<String, DhcpLease> {
        self.leases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, lease)| reference.is_none_or(|r| r == lease.reference))
            .map(|(mac, lease)| (mac.to_hex_string(), lease.clone()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn lease(ip: [u8; 4]) -> DhcpLease {
        DhcpLease {
            server_ip: Ipv4Addr::new(192, 168, 0, 2),
            client_ip: Ipv4Addr::from(ip),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Some(Ipv4Addr::new(192, 168, 0, 1)),
            dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            domain_name: None,
            domain_search: Vec::new(),
            ntp: Vec::new(),
            lease_time: 1800,
            reference: "default/vm-1".to_string(),
        }
    }

    #[test]
    fn test_lease_for_pool() {
        let pool = IPPool::new(
            "net-1",
            crds::IPPoolSpec {
                network_name: "default/net-1".to_string(),
                ipv4: crds::IPv4Config {
                    server_ip: "192.168.0.2".to_string(),
                    cidr: "192.168.0.0/24".to_string(),
                    router: Some("192.168.0.1".to_string()),
                    dns: vec!["8.8.8.8".to_string()],
                    domain_search: vec!["example.com".to_string()],
                    ..Default::default()
                },
                paused: None,
            },
        );
        let l = DhcpLease::for_pool(&pool, Ipv4Addr::new(192, 168, 0, 150), "default/vm-1").unwrap();
        assert_eq!(l.server_ip, Ipv4Addr::new(192, 168, 0, 2));
        assert_eq!(l.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(l.router, Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(l.lease_time, crds::DEFAULT_LEASE_TIME);
        assert_eq!(l.domain_search, vec!["example.com".to_string()]);

        let mut no_server = pool.clone();
        no_server.spec.ipv4.server_ip = String::new();
        assert!(matches!(
            DhcpLease::for_pool(&no_server, Ipv4Addr::new(192, 168, 0, 150), "default/vm-1"),
            Err(DhcpError::InvalidPool(_))
        ));
    }

    #[test]
    fn test_add_get_delete() {
        let table = LeaseTable::new();
        table
            .add_lease("aa:bb:cc:dd:ee:01", lease([192, 168, 0, 150]))
            .unwrap();

        assert!(table.check_lease("AA:BB:CC:DD:EE:01"));
        assert_eq!(
            table.get_lease("aa-bb-cc-dd-ee-01").map(|l| l.client_ip),
            Some(Ipv4Addr::new(192, 168, 0, 150))
        );

        let removed = table.delete_lease("aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(removed.client_ip, Ipv4Addr::new(192, 168, 0, 150));
        assert!(!table.check_lease("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn test_add_existing_fails() {
        let table = LeaseTable::new();
        table
            .add_lease("aa:bb:cc:dd:ee:01", lease([192, 168, 0, 150]))
            .unwrap();
        let err = table
            .add_lease("aa:bb:cc:dd:ee:01", lease([192, 168, 0, 151]))
            .unwrap_err();
        assert!(matches!(err, DhcpError::AlreadyExists(mac) if mac == "aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn test_rejects_invalid_mac() {
        let table = LeaseTable::new();
        assert!(matches!(
            table.add_lease("", lease([192, 168, 0, 150])),
            Err(DhcpError::InvalidMac(_))
        ));
        assert!(matches!(
            table.add_lease("not-a-mac", lease([192, 168, 0, 150])),
            Err(DhcpError::InvalidMac(_))
        ));
        assert!(!table.check_lease("not-a-mac"));
    }

    #[test]
    fn test_delete_unknown() {
        let table = LeaseTable::new();
        assert!(matches!(
            table.delete_lease("aa:bb:cc:dd:ee:01"),
            Err(DhcpError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_all_by_reference() {
        let table = LeaseTable::new();
        table
            .add_lease("aa:bb:cc:dd:ee:01", lease([192, 168, 0, 150]))
            .unwrap();
        let mut other = lease([192, 168, 0, 151]);
        other.reference = "default/vm-2".to_string();
        table.add_lease("aa:bb:cc:dd:ee:02", other).unwrap();

        assert_eq!(table.list_all(None).len(), 2);
        let only = table.list_all(Some("default/vm-2"));
        assert_eq!(only.len(), 1);
        assert!(only.contains_key("aa:bb:cc:dd:ee:02"));

        let json = serde_json::to_value(&only["aa:bb:cc:dd:ee:02"]).unwrap();
        assert_eq!(json["clientIP"], "192.168.0.151");
        assert_eq!(json["leaseTime"], 1800);
    }
}
