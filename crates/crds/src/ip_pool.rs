//! IPPool CRD
//!
//! Defines one IPv4 network's DHCP configuration and its allocation map.
//! Cluster-scoped; one pool per network.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, ConditionType, is_condition_true};
use crate::error::CrdError;
use crate::references::{NetworkName, PodReference};

/// Tag written into `status.ipv4.allocated` for excluded addresses.
pub const EXCLUDED_TAG: &str = "EXCLUDED";

/// Tag written into `status.ipv4.allocated` for addresses held by the
/// network itself (DHCP server, router).
pub const RESERVED_TAG: &str = "RESERVED";

/// Lease time handed out when the pool does not set one.
pub const DEFAULT_LEASE_TIME: u32 = 3600;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.harvesterhci.io",
    version = "v1alpha1",
    kind = "IPPool",
    plural = "ippools",
    shortname = "ippl",
    status = "IPPoolStatus",
    printcolumn = r#"{"name":"NETWORK","type":"string","jsonPath":".spec.networkName"}"#,
    printcolumn = r#"{"name":"AVAILABLE","type":"integer","jsonPath":".status.ipv4.available"}"#,
    printcolumn = r#"{"name":"USED","type":"integer","jsonPath":".status.ipv4.used"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Canonical `namespace/name` of the network attachment this pool serves
    pub network_name: String,

    /// IPv4 addressing and DHCP options
    pub ipv4: IPv4Config,

    /// Administratively disable the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
}

/// IPv4 addressing and DHCP options of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPv4Config {
    /// Address of the DHCP server on this network; defaulted by the webhook
    #[serde(rename = "serverIP", default)]
    pub server_ip: String,

    /// Subnet in CIDR notation, host bits zero
    pub cidr: String,

    /// Allocatable range and exclusions
    #[serde(default)]
    pub pool: Pool,

    /// Default gateway handed to clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,

    /// DNS servers handed to clients
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,

    /// Domain name option
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,

    /// Domain search list option
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_search: Vec<String>,

    /// NTP servers handed to clients
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ntp: Vec<String>,

    /// Lease time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_time: Option<u32>,
}

/// Inclusive host range inside the CIDR.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// First allocatable address; defaulted to network + 1
    #[serde(default)]
    pub start: String,

    /// Last allocatable address; defaulted to broadcast - 1
    #[serde(default)]
    pub end: String,

    /// Addresses that must never be allocated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolStatus {
    /// Allocation map and counters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<IPv4Status>,

    /// Agent pod serving this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pod_ref: Option<PodReference>,

    /// Registered, CacheReady, AgentReady, Ready, Disabled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last time the allocation map was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,

    /// `lastUpdate` as observed when the current controller process started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_before_start: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPv4Status {
    /// ip -> MAC address, `EXCLUDED` or `RESERVED`
    #[serde(default)]
    pub allocated: BTreeMap<String, String>,

    /// Number of addresses bound to a MAC
    #[serde(default)]
    pub used: u32,

    /// Number of free addresses left in the pool range
    #[serde(default)]
    pub available: u32,
}

/// Returns true when an allocation tag marks an address not bound to a MAC.
pub fn is_sentinel_tag(tag: &str) -> bool {
    tag == EXCLUDED_TAG || tag == RESERVED_TAG
}

/// Parsed, validated view of an [`IPv4Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIPv4Config {
    /// Subnet
    pub cidr: Ipv4Net,
    /// DHCP server address, if set
    pub server_ip: Option<Ipv4Addr>,
    /// Pool start, if set
    pub start: Option<Ipv4Addr>,
    /// Pool end, if set
    pub end: Option<Ipv4Addr>,
    /// Exclusions
    pub exclude: Vec<Ipv4Addr>,
    /// Gateway
    pub router: Option<Ipv4Addr>,
    /// DNS servers
    pub dns: Vec<Ipv4Addr>,
    /// NTP servers
    pub ntp: Vec<Ipv4Addr>,
}

impl ParsedIPv4Config {
    /// Network address of the subnet
    pub fn network(&self) -> Ipv4Addr {
        self.cidr.network()
    }

    /// Broadcast address of the subnet
    pub fn broadcast(&self) -> Ipv4Addr {
        self.cidr.broadcast()
    }

    /// Subnet mask
    pub fn netmask(&self) -> Ipv4Addr {
        self.cidr.netmask()
    }
}

/// Parses an IPv4 CIDR and rejects networks with host bits set.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, CrdError> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|_| CrdError::InvalidCidr(cidr.to_string()))?;
    if net.trunc() != net {
        return Err(CrdError::HostBitsSet(cidr.to_string()));
    }
    Ok(net)
}

fn parse_optional(field: &'static str, value: &str) -> Result<Option<Ipv4Addr>, CrdError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| CrdError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}

fn parse_list(field: &'static str, values: &[String]) -> Result<Vec<Ipv4Addr>, CrdError> {
    values
        .iter()
        .map(|v| {
            v.trim().parse().map_err(|_| CrdError::InvalidAddress {
                field,
                value: v.clone(),
            })
        })
        .collect()
}

impl IPv4Config {
    /// Parses every address field. Empty strings map to `None`.
    pub fn parse(&self) -> Result<ParsedIPv4Config, CrdError> {
        Ok(ParsedIPv4Config {
            cidr: parse_cidr(&self.cidr)?,
            server_ip: parse_optional("serverIP", &self.server_ip)?,
            start: parse_optional("pool.start", &self.pool.start)?,
            end: parse_optional("pool.end", &self.pool.end)?,
            exclude: parse_list("pool.exclude", &self.pool.exclude)?,
            router: match &self.router {
                Some(r) => parse_optional("router", r)?,
                None => None,
            },
            dns: parse_list("dns", &self.dns)?,
            ntp: parse_list("ntp", &self.ntp)?,
        })
    }

    /// Lease time, falling back to [`DEFAULT_LEASE_TIME`].
    pub fn lease_time_or_default(&self) -> u32 {
        self.lease_time.unwrap_or(DEFAULT_LEASE_TIME)
    }
}

impl IPPool {
    /// Network this pool serves.
    pub fn network_name(&self) -> &str {
        &self.spec.network_name
    }

    /// Parsed network identifier.
    pub fn network(&self) -> Result<NetworkName, CrdError> {
        NetworkName::parse(&self.spec.network_name, None)
    }

    /// Canonical `namespace/name` of the pool's network, the key of its
    /// allocator state. Falls back to the raw value when it does not parse.
    pub fn network_key(&self) -> String {
        self.network()
            .map_or_else(|_| self.spec.network_name.clone(), |n| n.to_string())
    }

    /// Whether the pool is administratively disabled.
    pub fn is_paused(&self) -> bool {
        self.spec.paused.unwrap_or(false)
    }

    /// Allocation map from status, empty when absent.
    pub fn allocated(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .and_then(|s| s.ipv4.as_ref())
            .map(|v| v.allocated.clone())
            .unwrap_or_default()
    }

    /// Whether a condition of the given type is True on this pool.
    pub fn condition_true(&self, type_: ConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, type_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IPv4Config {
        IPv4Config {
            server_ip: "192.168.0.2".to_string(),
            cidr: "192.168.0.0/24".to_string(),
            pool: Pool {
                start: "192.168.0.101".to_string(),
                end: "192.168.0.200".to_string(),
                exclude: vec!["192.168.0.150".to_string()],
            },
            router: Some("192.168.0.1".to_string()),
            dns: vec!["8.8.8.8".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_full_config() {
        let parsed = config().parse().unwrap();
        assert_eq!(parsed.network(), Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(parsed.broadcast(), Ipv4Addr::new(192, 168, 0, 255));
        assert_eq!(parsed.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(parsed.server_ip, Some(Ipv4Addr::new(192, 168, 0, 2)));
        assert_eq!(parsed.exclude, vec![Ipv4Addr::new(192, 168, 0, 150)]);
        assert_eq!(parsed.dns, vec![Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[test]
    fn test_parse_empty_fields_are_none() {
        let mut cfg = config();
        cfg.server_ip = String::new();
        cfg.pool.start = String::new();
        let parsed = cfg.parse().unwrap();
        assert_eq!(parsed.server_ip, None);
        assert_eq!(parsed.start, None);
    }

    #[test]
    fn test_parse_cidr_rejects_host_bits() {
        assert_eq!(
            parse_cidr("192.168.0.1/24"),
            Err(CrdError::HostBitsSet("192.168.0.1/24".to_string()))
        );
        assert!(matches!(parse_cidr("not-a-cidr"), Err(CrdError::InvalidCidr(_))));
        assert!(parse_cidr("10.0.0.0/30").is_ok());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let mut allocated = BTreeMap::new();
        allocated.insert("192.168.0.150".to_string(), "aa:bb:cc:dd:ee:01".to_string());
        let status = IPPoolStatus {
            ipv4: Some(IPv4Status {
                allocated,
                used: 1,
                available: 99,
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["ipv4"]["used"], 1);
        assert_eq!(json["ipv4"]["allocated"]["192.168.0.150"], "aa:bb:cc:dd:ee:01");
        assert!(json.get("lastUpdateBeforeStart").is_none());
    }

    #[test]
    fn test_server_ip_field_name() {
        let json = serde_json::to_value(config()).unwrap();
        assert_eq!(json["serverIP"], "192.168.0.2");
    }

    #[test]
    fn test_network_key_is_canonical() {
        let pool = |network: &str| {
            IPPool::new(
                "net-1",
                IPPoolSpec {
                    network_name: network.to_string(),
                    ipv4: config(),
                    paused: None,
                },
            )
        };
        assert_eq!(pool("net-1").network_key(), "default/net-1");
        assert_eq!(pool("default/net-1").network_key(), "default/net-1");
        assert_eq!(pool("other/net-1").network_key(), "other/net-1");
    }
}
