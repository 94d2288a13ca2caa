//! Cache-dump capability.
//!
//! Every in-memory structure exposes its content as a JSON map so a single
//! set of HTTP routes can serve all of them.

use std::sync::Arc;

use dhcp_server::LeaseTable;
use ipam::{CacheAllocator, IpAllocator};
use serde_json::Value;

/// Something that can list its entries, optionally for one network.
pub trait Dumper: Send + Sync {
    /// Entries as JSON; `filter` selects one network when supported.
    fn list_all(&self, filter: Option<&str>) -> Value;
}

impl Dumper for IpAllocator {
    fn list_all(&self, filter: Option<&str>) -> Value {
        serde_json::to_value(IpAllocator::list_all(self, filter)).unwrap_or(Value::Null)
    }
}

impl Dumper for CacheAllocator {
    fn list_all(&self, filter: Option<&str>) -> Value {
        serde_json::to_value(CacheAllocator::list_all(self, filter)).unwrap_or(Value::Null)
    }
}

impl Dumper for LeaseTable {
    fn list_all(&self, filter: Option<&str>) -> Value {
        serde_json::to_value(LeaseTable::list_all(self, filter)).unwrap_or(Value::Null)
    }
}

/// Structures exposed on the debug routes; absent ones answer 404.
#[derive(Clone, Default)]
pub struct DebugDumps {
    /// Served on `/ipams/{network}`
    pub ipam: Option<Arc<dyn Dumper>>,
    /// Served on `/caches/{network}`
    pub cache: Option<Arc<dyn Dumper>>,
    /// Served on `/leases`
    pub leases: Option<Arc<dyn Dumper>>,
}

impl std::fmt::Debug for DebugDumps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugDumps")
            .field("ipam", &self.ipam.is_some())
            .field("cache", &self.cache.is_some())
            .field("leases", &self.leases.is_some())
            .finish()
    }
}
