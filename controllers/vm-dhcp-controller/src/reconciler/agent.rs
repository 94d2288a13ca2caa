//! Agent pod construction and drift detection.
//!
//! Each IPPool is served by one agent pod attached to the pool's network as
//! `eth1`. An init container assigns `serverIP/prefix` to that interface
//! before the agent starts its DHCP server.

use std::collections::BTreeMap;

use crds::labels::{
    AGENT_INTERFACE, AGENT_LABEL_VALUE, AGENT_SERVER_IP_ANNOTATION, IPPOOL_NAME_LABEL_KEY,
    IPPOOL_NAMESPACE_LABEL_KEY, MULTUS_NETWORKS_ANNOTATION, VM_DHCP_CONTROLLER_LABEL_KEY,
};
use crds::{AgentNetworkConfig, IPPool, IPPoolReference, NetworkName, ParsedIPv4Config, PodReference};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, HTTPGetAction, Pod, PodSpec, Probe, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::error::ControllerError;

/// HTTP port of the agent's health endpoints
pub const AGENT_HTTP_PORT: u16 = 8080;

/// How agent pods are deployed.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Namespace agent pods run in
    pub namespace: String,
    /// Agent container image
    pub image: String,
    /// Service account of agent pods
    pub service_account: Option<String>,
}

/// Name of the agent pod serving `pool`.
pub fn agent_pod_name(network: &NetworkName, pool_name: &str) -> String {
    format!("{}-{pool_name}-agent", network.namespace)
}

/// `serverIP/prefix` assigned to the agent's pool interface.
pub fn server_address(parsed: &ParsedIPv4Config) -> Option<String> {
    parsed
        .server_ip
        .map(|ip| format!("{ip}/{}", parsed.cidr.prefix_len()))
}

fn networks_annotation(network: &NetworkName) -> Result<String, ControllerError> {
    let attachments = vec![AgentNetworkConfig {
        namespace: network.namespace.clone(),
        name: network.name.clone(),
        interface: AGENT_INTERFACE.to_string(),
    }];
    serde_json::to_string(&attachments).map_err(|e| ControllerError::Fatal(e.to_string()))
}

fn root_with(capabilities: &[&str]) -> SecurityContext {
    SecurityContext {
        run_as_user: Some(0),
        run_as_group: Some(0),
        capabilities: Some(Capabilities {
            add: Some(capabilities.iter().map(|c| (*c).to_owned()).collect()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn http_check(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_owned()),
            port: IntOrString::Int(i32::from(AGENT_HTTP_PORT)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value),
        ..Default::default()
    }
}

/// Builds the agent pod for `pool`.
pub fn build_agent_pod(
    pool: &IPPool,
    parsed: &ParsedIPv4Config,
    settings: &AgentSettings,
) -> Result<Pod, ControllerError> {
    let pool_name = pool.name_any();
    let network = pool
        .network()
        .map_err(|e| ControllerError::ValidationFailed(e.to_string()))?;
    let address = server_address(parsed).ok_or_else(|| {
        ControllerError::ValidationFailed(format!("ippool {pool_name} has no serverIP"))
    })?;
    let networks = networks_annotation(&network)?;
    let ippool_refs = serde_json::to_string(&[IPPoolReference {
        namespace: network.namespace.clone(),
        name: pool_name.clone(),
    }])
    .map_err(|e| ControllerError::Fatal(e.to_string()))?;

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(agent_pod_name(&network, &pool_name)),
            namespace: Some(settings.namespace.clone()),
            labels: Some(BTreeMap::from([
                (VM_DHCP_CONTROLLER_LABEL_KEY.to_owned(), AGENT_LABEL_VALUE.to_owned()),
                (IPPOOL_NAMESPACE_LABEL_KEY.to_owned(), network.namespace.clone()),
                (IPPOOL_NAME_LABEL_KEY.to_owned(), pool_name.clone()),
            ])),
            annotations: Some(BTreeMap::from([
                (MULTUS_NETWORKS_ANNOTATION.to_owned(), networks.clone()),
                (AGENT_SERVER_IP_ANNOTATION.to_owned(), address.clone()),
            ])),
            owner_references: pool.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: settings.service_account.clone(),
            init_containers: Some(vec![Container {
                name: "ip-setter".to_owned(),
                image: Some(settings.image.clone()),
                command: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
                args: Some(vec![format!(
                    "ip address flush dev {AGENT_INTERFACE} && ip address add {address} dev {AGENT_INTERFACE}"
                )]),
                security_context: Some(root_with(&["NET_ADMIN"])),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "agent".to_owned(),
                image: Some(settings.image.clone()),
                args: Some(vec![
                    "--no-leader-election".to_owned(),
                    "--http-port".to_owned(),
                    AGENT_HTTP_PORT.to_string(),
                ]),
                env: Some(vec![
                    env("AGENT_NETWORK_CONFIGS", networks),
                    env("IPPOOL_REFS_JSON", ippool_refs),
                ]),
                security_context: Some(root_with(&["NET_ADMIN", "NET_RAW"])),
                readiness_probe: Some(http_check("/readyz")),
                liveness_probe: Some(http_check("/healthz")),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Whether a running agent pod no longer matches what `expected` describes.
pub fn has_drifted(live: &Pod, expected: &Pod) -> bool {
    let annotation = |pod: &Pod, key: &str| pod.annotations().get(key).cloned();
    let image = |pod: &Pod| {
        pod.spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
    };
    annotation(live, AGENT_SERVER_IP_ANNOTATION) != annotation(expected, AGENT_SERVER_IP_ANNOTATION)
        || annotation(live, MULTUS_NETWORKS_ANNOTATION) != annotation(expected, MULTUS_NETWORKS_ANNOTATION)
        || image(live) != image(expected)
}

/// Whether the pod reports the `Ready` condition.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Reference recorded in the pool status.
pub fn pod_reference(pod: &Pod) -> PodReference {
    PodReference {
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        image: pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone()),
        uid: pod.meta().uid.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_ip_pool;
    use serde_json::json;

    fn settings() -> AgentSettings {
        AgentSettings {
            namespace: "harvester-system".to_string(),
            image: "vm-dhcp-agent:test".to_string(),
            service_account: Some("vm-dhcp-agent".to_string()),
        }
    }

    #[test]
    fn test_build_agent_pod() {
        let pool = create_test_ip_pool("net-1", "default/net-1");
        let parsed = pool.spec.ipv4.parse().unwrap();
        let pod = build_agent_pod(&pool, &parsed, &settings()).unwrap();

        assert_eq!(pod.name_any(), "default-net-1-agent");
        assert_eq!(pod.namespace().as_deref(), Some("harvester-system"));
        assert_eq!(pod.labels()[VM_DHCP_CONTROLLER_LABEL_KEY], AGENT_LABEL_VALUE);
        assert_eq!(pod.labels()[IPPOOL_NAMESPACE_LABEL_KEY], "default");
        assert_eq!(pod.labels()[IPPOOL_NAME_LABEL_KEY], "net-1");
        assert_eq!(pod.annotations()[AGENT_SERVER_IP_ANNOTATION], "192.168.0.2/24");

        let networks: Vec<AgentNetworkConfig> =
            serde_json::from_str(&pod.annotations()[MULTUS_NETWORKS_ANNOTATION]).unwrap();
        assert_eq!(networks[0].name, "net-1");
        assert_eq!(networks[0].interface, "eth1");

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.service_account_name.as_deref(), Some("vm-dhcp-agent"));
        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert!(init.args.as_ref().unwrap()[0].contains("192.168.0.2/24 dev eth1"));
        let env = spec.containers[0].env.as_ref().unwrap();
        let refs = env.iter().find(|e| e.name == "IPPOOL_REFS_JSON").unwrap();
        assert_eq!(refs.value.as_deref(), Some(r#"[{"namespace":"default","name":"net-1"}]"#));

        let agent = &spec.containers[0];
        let readiness = agent.readiness_probe.as_ref().and_then(|p| p.http_get.as_ref()).unwrap();
        assert_eq!(readiness.path.as_deref(), Some("/readyz"));
        assert_eq!(readiness.port, IntOrString::Int(8080));
        let caps = agent
            .security_context
            .as_ref()
            .and_then(|c| c.capabilities.as_ref())
            .and_then(|c| c.add.clone())
            .unwrap();
        assert_eq!(caps, vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]);
    }

    #[test]
    fn test_drift_on_server_ip_change() {
        let pool = create_test_ip_pool("net-1", "default/net-1");
        let parsed = pool.spec.ipv4.parse().unwrap();
        let live = build_agent_pod(&pool, &parsed, &settings()).unwrap();
        assert!(!has_drifted(&live, &live.clone()));

        let mut moved = pool.clone();
        moved.spec.ipv4.server_ip = "192.168.0.3".to_string();
        let expected = build_agent_pod(&moved, &moved.spec.ipv4.parse().unwrap(), &settings()).unwrap();
        assert!(has_drifted(&live, &expected));
    }

    #[test]
    fn test_pod_readiness() {
        let pool = create_test_ip_pool("net-1", "default/net-1");
        let parsed = pool.spec.ipv4.parse().unwrap();
        let mut pod = build_agent_pod(&pool, &parsed, &settings()).unwrap();
        assert!(!is_pod_ready(&pod));

        pod.status = Some(serde_json::from_value(json!({
            "conditions": [{ "type": "Ready", "status": "True" }]
        })).unwrap());
        assert!(is_pod_ready(&pod));
    }
}
