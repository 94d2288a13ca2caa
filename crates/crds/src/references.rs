//! Cross-resource references.
//!
//! IPPools, VMNetCfgs and leases refer to each other by plain keys
//! (network name, MAC address) resolved on access, never by pointer.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::CrdError;

/// Namespace used when a reference omits one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Network identifier, canonical form `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkName {
    /// Namespace of the network attachment definition
    pub namespace: String,
    /// Name of the network attachment definition
    pub name: String,
}

impl NetworkName {
    /// Parses `namespace/name` or bare `name`; bare names resolve into
    /// `default_namespace` (or `default` when none is given).
    pub fn parse(value: &str, default_namespace: Option<&str>) -> Result<Self, CrdError> {
        let value = value.trim();
        let (namespace, name) = match value.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace.unwrap_or(DEFAULT_NAMESPACE), value),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(CrdError::InvalidNetworkName(value.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to an IPPool, carried in the agent's `IPPOOL_REFS_JSON`.
///
/// IPPools are cluster-scoped; `namespace` carries the namespace of the
/// pool's network so that agent pods can be selected per network namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolReference {
    /// Namespace of the pool's network
    #[serde(default)]
    pub namespace: String,
    /// IPPool name
    pub name: String,
}

/// One Multus attachment, as carried in `AGENT_NETWORK_CONFIGS` and in the
/// `k8s.v1.cni.cncf.io/networks` pod annotation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentNetworkConfig {
    /// Namespace of the network attachment definition
    pub namespace: String,
    /// Name of the network attachment definition
    pub name: String,
    /// Interface name inside the pod
    pub interface: String,
}

/// Reference to the agent pod backing a pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Agent image the pod runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Pod UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified_network_name() {
        let n = NetworkName::parse("default/net-1", None).unwrap();
        assert_eq!(n.namespace, "default");
        assert_eq!(n.name, "net-1");
        assert_eq!(n.to_string(), "default/net-1");
    }

    #[test]
    fn test_parse_bare_network_name_uses_default_namespace() {
        let n = NetworkName::parse("net-1", Some("vms")).unwrap();
        assert_eq!(n.to_string(), "vms/net-1");
        let n = NetworkName::parse("net-1", None).unwrap();
        assert_eq!(n.to_string(), "default/net-1");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(NetworkName::parse("", None).is_err());
        assert!(NetworkName::parse("/net", None).is_err());
        assert!(NetworkName::parse("a/b/c", None).is_err());
    }

    #[test]
    fn test_agent_network_config_round_trips_json_array() {
        let raw = r#"[{"namespace":"default","name":"net-1","interface":"eth1"}]"#;
        let parsed: Vec<AgentNetworkConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].interface, "eth1");
    }
}
