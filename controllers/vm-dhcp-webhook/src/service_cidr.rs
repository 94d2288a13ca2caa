//! Cluster service CIDR discovery.
//!
//! RKE2 records the arguments a server node was started with in a node
//! annotation; `--service-cidr` there wins over the command-line default.

use cluster_client::ClusterClient;
use ipnet::Ipv4Net;
use kube::ResourceExt;
use tracing::{info, warn};

/// Node annotation carrying the RKE2 server arguments as a JSON array
pub const NODE_ARGS_ANNOTATION: &str = "rke2.io/node-args";

const SERVICE_CIDR_FLAG: &str = "--service-cidr";

/// First IPv4 network of a comma-separated CIDR list.
fn first_ipv4(value: &str) -> Option<Ipv4Net> {
    value.split(',').find_map(|c| c.trim().parse::<Ipv4Net>().ok())
}

/// `--service-cidr` from a node-args annotation value, in either the
/// `--flag value` or the `--flag=value` form.
pub fn service_cidr_from_node_args(raw: &str) -> Option<Ipv4Net> {
    let args: Vec<String> = serde_json::from_str(raw).ok()?;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == SERVICE_CIDR_FLAG {
            return iter.next().and_then(|v| first_ipv4(v));
        }
        if let Some(value) = arg.strip_prefix("--service-cidr=") {
            return first_ipv4(value);
        }
    }
    None
}

/// Service CIDR of the cluster, or `fallback` when no node records one.
pub async fn discover_service_cidr(client: &dyn ClusterClient, fallback: Ipv4Net) -> Ipv4Net {
    let nodes = match client.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, fallback = %fallback, "Failed to list nodes, using default service CIDR");
            return fallback;
        }
    };
    let discovered = nodes.iter().find_map(|node| {
        node.annotations()
            .get(NODE_ARGS_ANNOTATION)
            .and_then(|raw| service_cidr_from_node_args(raw))
    });
    match discovered {
        Some(cidr) => {
            info!(service_cidr = %cidr, "Discovered service CIDR from node annotation");
            cidr
        }
        None => {
            info!(service_cidr = %fallback, "No node records a service CIDR, using default");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::MockClusterClient;
    use k8s_openapi::api::core::v1::Node;
    use std::collections::BTreeMap;

    fn node(name: &str, args: Option<&str>) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        if let Some(args) = args {
            node.metadata.annotations = Some(BTreeMap::from([(NODE_ARGS_ANNOTATION.to_string(), args.to_string())]));
        }
        node
    }

    #[test]
    fn test_parse_node_args() {
        assert_eq!(
            service_cidr_from_node_args(r#"["server","--service-cidr","10.43.0.0/16"]"#),
            Some("10.43.0.0/16".parse().unwrap())
        );
        assert_eq!(
            service_cidr_from_node_args(r#"["server","--service-cidr=fd00::/108,10.44.0.0/16"]"#),
            Some("10.44.0.0/16".parse().unwrap())
        );
        assert_eq!(service_cidr_from_node_args(r#"["server"]"#), None);
        assert_eq!(service_cidr_from_node_args("not json"), None);
    }

    #[tokio::test]
    async fn test_discover_falls_back() {
        let fallback: Ipv4Net = "10.53.0.0/16".parse().unwrap();
        let client = MockClusterClient::new();
        client.add_node(node("worker", None));
        assert_eq!(discover_service_cidr(&client, fallback).await, fallback);

        client.add_node(node("server", Some(r#"["server","--service-cidr","10.43.0.0/16"]"#)));
        assert_eq!(
            discover_service_cidr(&client, fallback).await,
            "10.43.0.0/16".parse::<Ipv4Net>().unwrap()
        );
    }
}
