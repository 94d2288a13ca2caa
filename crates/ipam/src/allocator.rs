//! Per-network IPv4 allocator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnet::Ipv4Net;
use tracing::debug;

use crate::error::IpamError;

/// State of a tracked address. Untracked addresses in the pool range are free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Allocated,
    Revoked,
}

#[derive(Debug)]
struct Subnet {
    cidr: Ipv4Net,
    start: u32,
    end: u32,
    slots: BTreeMap<u32, Slot>,
}

impl Subnet {
    fn new(cidr: Ipv4Net, start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, IpamError> {
        let invalid = |reason| IpamError::InvalidRange { start, end, reason };
        if !cidr.contains(&start) || !cidr.contains(&end) {
            return Err(invalid("range not within cidr"));
        }
        if u32::from(start) > u32::from(end) {
            return Err(invalid("start is greater than end"));
        }
        if end == cidr.broadcast() {
            return Err(invalid("end is the broadcast address"));
        }
        Ok(Self {
            cidr,
            start: start.into(),
            end: end.into(),
            slots: BTreeMap::new(),
        })
    }

    fn in_range(&self, ip: u32) -> bool {
        (self.start..=self.end).contains(&ip)
    }

    /// Address must be a host of the CIDR other than the broadcast address.
    fn check_addressable(&self, ip: Ipv4Addr) -> Result<u32, IpamError> {
        if !self.cidr.contains(&ip) || ip == self.cidr.broadcast() {
            return Err(IpamError::OutOfRange(ip));
        }
        Ok(ip.into())
    }

    fn size(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Lowest free address in `[start, end]`.
    fn first_free(&self) -> Option<u32> {
        let mut candidate = self.start;
        for &ip in self.slots.range(self.start..=self.end).map(|(ip, _)| ip) {
            if ip != candidate {
                break;
            }
            // end < broadcast, so this never overflows
            candidate += 1;
        }
        (candidate <= self.end).then_some(candidate)
    }

    fn used(&self) -> u32 {
        let count = self
            .slots
            .values()
            .filter(|s| **s == Slot::Allocated)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn available(&self) -> u32 {
        let taken = self.slots.range(self.start..=self.end).count();
        self.size() - u32::try_from(taken).unwrap_or(u32::MAX)
    }
}

/// Subnet arithmetic and allocation map, one subnet per network name.
#[derive(Debug, Default)]
pub struct IpAllocator {
    subnets: Mutex<HashMap<String, Subnet>>,
}

impl IpAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subnet>> {
        self.subnets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a subnet whose pool range `[start, end]` starts out free.
    ///
    /// Replaces any subnet already registered under `name`.
    pub fn new_subnet(
        &self,
        name: &str,
        cidr: &str,
        start: Ipv4Addr,
        end: Ipv4Addr,
    ) -> Result<(), IpamError> {
        let cidr: Ipv4Net = cidr
            .trim()
            .parse()
            .map_err(|_| IpamError::InvalidCidr(cidr.to_string()))?;
        let subnet = Subnet::new(cidr.trunc(), start, end)?;
        debug!(subnet = %name, cidr = %cidr, %start, %end, "Installing subnet");
        self.lock().insert(name.to_string(), subnet);
        Ok(())
    }

    /// Whether `name` is registered with exactly these parameters.
    pub fn subnet_matches(&self, name: &str, cidr: &str, start: Ipv4Addr, end: Ipv4Addr) -> bool {
        let Ok(cidr) = cidr.trim().parse::<Ipv4Net>() else {
            return false;
        };
        self.lock().get(name).is_some_and(|s| {
            s.cidr == cidr.trunc() && s.start == u32::from(start) && s.end == u32::from(end)
        })
    }

    /// Whether a subnet is registered under `name`.
    pub fn has_subnet(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Removes a subnet and everything allocated in it.
    pub fn delete_subnet(&self, name: &str) {
        if self.lock().remove(name).is_some() {
            debug!(subnet = %name, "Deleted subnet");
        }
    }

    /// Marks `ip` unavailable. Idempotent.
    pub fn revoke_ip(&self, name: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        let mut subnets = self.lock();
        let subnet = subnets
            .get_mut(name)
            .ok_or_else(|| IpamError::SubnetNotFound(name.to_string()))?;
        let key = subnet.check_addressable(ip)?;
        subnet.slots.insert(key, Slot::Revoked);
        Ok(())
    }

    /// Revoked addresses of a subnet.
    pub fn revoked(&self, name: &str) -> BTreeSet<Ipv4Addr> {
        self.lock()
            .get(name)
            .map(|s| {
                s.slots
                    .iter()
                    .filter(|(_, slot)| **slot == Slot::Revoked)
                    .map(|(ip, _)| Ipv4Addr::from(*ip))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Allocates `hint`, or the lowest free address when `hint` is unspecified.
    ///
    /// A hint inside the CIDR but outside the pool range is honoured and
    /// tracked; it never counts against `available`.
    pub fn allocate_ip(&self, name: &str, hint: Ipv4Addr) -> Result<Ipv4Addr, IpamError> {
        let mut subnets = self.lock();
        let subnet = subnets
            .get_mut(name)
            .ok_or_else(|| IpamError::SubnetNotFound(name.to_string()))?;

        let key = if hint.is_unspecified() {
            subnet
                .first_free()
                .ok_or_else(|| IpamError::Exhausted(name.to_string()))?
        } else {
            let key = subnet.check_addressable(hint)?;
            if subnet.slots.contains_key(&key) {
                return Err(IpamError::Unavailable(hint));
            }
            key
        };

        subnet.slots.insert(key, Slot::Allocated);
        let ip = Ipv4Addr::from(key);
        debug!(subnet = %name, %ip, "Allocated ip");
        Ok(ip)
    }

    /// Returns an allocated address to the pool.
    pub fn release_ip(&self, name: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        let mut subnets = self.lock();
        let subnet = subnets
            .get_mut(name)
            .ok_or_else(|| IpamError::SubnetNotFound(name.to_string()))?;
        let key = u32::from(ip);
        match subnet.slots.get(&key) {
            Some(Slot::Allocated) => {
                subnet.slots.remove(&key);
                debug!(subnet = %name, %ip, in_range = subnet.in_range(key), "Released ip");
                Ok(())
            }
            _ => Err(IpamError::NotAllocated(ip)),
        }
    }

    /// Whether `ip` is allocated. Unknown subnets hold nothing.
    pub fn is_allocated(&self, name: &str, ip: Ipv4Addr) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|s| s.slots.get(&u32::from(ip)) == Some(&Slot::Allocated))
    }

    /// Number of allocated addresses, including allocations outside the range.
    pub fn get_used(&self, name: &str) -> Result<u32, IpamError> {
        self.lock()
            .get(name)
            .map(Subnet::used)
            .ok_or_else(|| IpamError::SubnetNotFound(name.to_string()))
    }

    /// Number of free addresses left in `[start, end]`.
    pub fn get_available(&self, name: &str) -> Result<u32, IpamError> {
        self.lock()
            .get(name)
            .map(Subnet::available)
            .ok_or_else(|| IpamError::SubnetNotFound(name.to_string()))
    }

    /// Tracked addresses as `ip → "allocated" | "revoked"`, keyed by subnet.
    ///
    /// `filter` restricts the dump to one subnet.
    pub fn list_all(&self, filter: Option<&str>) -> BTreeMap<String, BTreeMap<String, String>> {
        self.lock()
            .iter()
            .filter(|(name, _)| filter.is_none_or(|f| f == name.as_str()))
            .map(|(name, subnet)| {
                let entries = subnet
                    .slots
                    .iter()
                    .map(|(ip, slot)| {
                        let state = match slot {
                            Slot::Allocated => "allocated",
                            Slot::Revoked => "revoked",
                        };
                        (Ipv4Addr::from(*ip).to_string(), state.to_string())
                    })
                    .collect();
                (name.clone(), entries)
            })
            .collect()
    }
}
