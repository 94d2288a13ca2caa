//! MAC → IP index, one MAC set per network.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::IpamError;

type MacSets = HashMap<String, HashMap<String, Ipv4Addr>>;

/// Recovers the address previously assigned to a MAC without reading
/// cluster status. MACs are compared case-insensitively.
#[derive(Debug, Default)]
pub struct CacheAllocator {
    sets: Mutex<MacSets>,
}

fn normalize(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

impl CacheAllocator {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MacSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an empty MAC set. Existing sets are kept.
    pub fn new_mac_set(&self, name: &str) {
        self.lock().entry(name.to_string()).or_default();
    }

    /// Whether a MAC set is registered under `name`.
    pub fn has_mac_set(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Drops a MAC set and every entry in it.
    pub fn delete_mac_set(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Indexes `mac → ip`. Fails when the MAC is already indexed.
    pub fn add_mac(&self, name: &str, mac: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        let mut sets = self.lock();
        let set = sets
            .get_mut(name)
            .ok_or_else(|| IpamError::MacSetNotFound(name.to_string()))?;
        let mac = normalize(mac);
        if set.contains_key(&mac) {
            return Err(IpamError::MacAlreadyExists(mac));
        }
        set.insert(mac, ip);
        Ok(())
    }

    /// Address indexed for `mac`.
    pub fn get_ip_by_mac(&self, name: &str, mac: &str) -> Result<Ipv4Addr, IpamError> {
        let sets = self.lock();
        let set = sets
            .get(name)
            .ok_or_else(|| IpamError::MacSetNotFound(name.to_string()))?;
        let mac = normalize(mac);
        set.get(&mac).copied().ok_or(IpamError::MacNotFound(mac))
    }

    /// Removes `mac` from the set.
    pub fn delete_mac(&self, name: &str, mac: &str) -> Result<(), IpamError> {
        let mut sets = self.lock();
        let set = sets
            .get_mut(name)
            .ok_or_else(|| IpamError::MacSetNotFound(name.to_string()))?;
        let mac = normalize(mac);
        set.remove(&mac).map(|_| ()).ok_or(IpamError::MacNotFound(mac))
    }

    /// Whether `mac` is indexed. Unknown sets hold nothing.
    pub fn has_mac(&self, name: &str, mac: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|set| set.contains_key(&normalize(mac)))
    }

    /// Entries of one set, or of every set when `filter` is `None`.
    pub fn list_all(&self, filter: Option<&str>) -> BTreeMap<String, BTreeMap<String, String>> {
        self.lock()
            .iter()
            .filter(|(name, _)| filter.is_none_or(|f| f == name.as_str()))
            .map(|(name, set)| {
                let entries = set
                    .iter()
                    .map(|(mac, ip)| (mac.clone(), ip.to_string()))
                    .collect();
                (name.clone(), entries)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET: &str = "default/net-1";

    #[test]
    fn test_add_and_lookup() {
        let cache = CacheAllocator::new();
        cache.new_mac_set(NET);
        let ip = Ipv4Addr::new(192, 168, 0, 150);
        cache.add_mac(NET, "AA:BB:CC:DD:EE:01", ip).unwrap();

        assert!(cache.has_mac(NET, "aa:bb:cc:dd:ee:01"));
        assert_eq!(cache.get_ip_by_mac(NET, "aa:bb:cc:dd:ee:01"), Ok(ip));
        assert_eq!(
            cache.add_mac(NET, "aa:bb:cc:dd:ee:01", ip),
            Err(IpamError::MacAlreadyExists("aa:bb:cc:dd:ee:01".to_string()))
        );
    }

    #[test]
    fn test_missing_set_and_mac() {
        let cache = CacheAllocator::new();
        assert_eq!(
            cache.add_mac(NET, "aa:bb:cc:dd:ee:01", Ipv4Addr::LOCALHOST),
            Err(IpamError::MacSetNotFound(NET.to_string()))
        );
        assert!(!cache.has_mac(NET, "aa:bb:cc:dd:ee:01"));

        cache.new_mac_set(NET);
        assert_eq!(
            cache.delete_mac(NET, "aa:bb:cc:dd:ee:01"),
            Err(IpamError::MacNotFound("aa:bb:cc:dd:ee:01".to_string()))
        );
    }

    #[test]
    fn test_new_mac_set_keeps_entries() {
        let cache = CacheAllocator::new();
        cache.new_mac_set(NET);
        cache
            .add_mac(NET, "aa:bb:cc:dd:ee:01", Ipv4Addr::new(10, 0, 0, 5))
            .unwrap();
        cache.new_mac_set(NET);
        assert!(cache.has_mac(NET, "aa:bb:cc:dd:ee:01"));

        cache.delete_mac_set(NET);
        assert!(!cache.has_mac_set(NET));
    }

    #[test]
    fn test_delete_and_list() {
        let cache = CacheAllocator::new();
        cache.new_mac_set(NET);
        cache.new_mac_set("other/net");
        cache
            .add_mac(NET, "aa:bb:cc:dd:ee:01", Ipv4Addr::new(10, 0, 0, 5))
            .unwrap();
        cache
            .add_mac("other/net", "aa:bb:cc:dd:ee:02", Ipv4Addr::new(10, 1, 0, 5))
            .unwrap();

        let dump = cache.list_all(Some(NET));
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[NET]["aa:bb:cc:dd:ee:01"], "10.0.0.5");

        cache.delete_mac(NET, "aa:bb:cc:dd:ee:01").unwrap();
        assert!(cache.list_all(Some(NET))[NET].is_empty());
        assert_eq!(cache.list_all(None).len(), 2);
    }
}
