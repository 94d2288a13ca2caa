//! Pool and interface assignment handed to the agent through its environment.

use crds::{AgentNetworkConfig, IPPoolReference, NetworkName};

use crate::error::AgentError;

/// Env var carrying `[{namespace,name,interface}]`
pub const AGENT_NETWORK_CONFIGS_ENV: &str = "AGENT_NETWORK_CONFIGS";
/// Env var carrying `[{namespace,name}]`
pub const IPPOOL_REFS_ENV: &str = "IPPOOL_REFS_JSON";

/// What this agent serves: pools and the interfaces facing their networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Network attachments of the agent pod
    pub networks: Vec<AgentNetworkConfig>,
    /// IPPools whose leases this agent serves
    pub ippools: Vec<IPPoolReference>,
}

impl AgentConfig {
    /// Parses both JSON arrays. An agent without pools has nothing to do,
    /// so an empty pool list is rejected.
    pub fn parse(networks: &str, ippools: &str) -> Result<Self, AgentError> {
        let networks: Vec<AgentNetworkConfig> = serde_json::from_str(networks)
            .map_err(|e| AgentError::InvalidConfig(format!("{AGENT_NETWORK_CONFIGS_ENV}: {e}")))?;
        let ippools: Vec<IPPoolReference> = serde_json::from_str(ippools)
            .map_err(|e| AgentError::InvalidConfig(format!("{IPPOOL_REFS_ENV}: {e}")))?;
        if ippools.is_empty() {
            return Err(AgentError::InvalidConfig(format!("{IPPOOL_REFS_ENV} names no ippool")));
        }
        Ok(Self { networks, ippools })
    }

    /// Reads both variables from the process environment.
    pub fn from_env() -> Result<Self, AgentError> {
        let networks = std::env::var(AGENT_NETWORK_CONFIGS_ENV).unwrap_or_else(|_| "[]".to_string());
        let ippools = std::env::var(IPPOOL_REFS_ENV)
            .map_err(|_| AgentError::InvalidConfig(format!("{IPPOOL_REFS_ENV} is required")))?;
        Self::parse(&networks, &ippools)
    }

    /// Whether this agent serves IPPool `name`.
    pub fn serves(&self, name: &str) -> bool {
        self.ippools.iter().any(|r| r.name == name)
    }

    /// Interface attached to `network`, if the pod has one.
    pub fn interface_for(&self, network: &NetworkName) -> Option<&str> {
        self.networks
            .iter()
            .find(|n| n.namespace == network.namespace && n.name == network.name)
            .map(|n| n.interface.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORKS: &str = r#"[{"namespace":"default","name":"net-1","interface":"eth1"}]"#;

    #[test]
    fn test_parse() {
        let config = AgentConfig::parse(NETWORKS, r#"[{"namespace":"default","name":"pool-1"}]"#).unwrap();
        assert!(config.serves("pool-1"));
        assert!(!config.serves("pool-2"));

        let network = NetworkName::parse("default/net-1", None).unwrap();
        assert_eq!(config.interface_for(&network), Some("eth1"));
        let other = NetworkName::parse("other/net-1", None).unwrap();
        assert_eq!(config.interface_for(&other), None);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            AgentConfig::parse("not json", r#"[{"name":"pool-1"}]"#),
            Err(AgentError::InvalidConfig(_))
        ));
        assert!(matches!(AgentConfig::parse(NETWORKS, "[]"), Err(AgentError::InvalidConfig(_))));
    }
}
