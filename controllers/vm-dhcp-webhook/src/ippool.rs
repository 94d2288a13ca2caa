//! IPPool defaulting and validation.

use std::net::Ipv4Addr;

use cluster_client::ClusterClient;
use crds::{IPPool, ParsedIPv4Config, is_sentinel_tag};
use ipnet::Ipv4Net;
use kube::ResourceExt;

use crate::error::WebhookError;

fn invalid(pool: &IPPool, reason: impl std::fmt::Display) -> WebhookError {
    WebhookError::ValidationFailed(format!("ippool {}: {reason}", pool.name_any()))
}

fn parse(pool: &IPPool) -> Result<ParsedIPv4Config, WebhookError> {
    pool.spec.ipv4.parse().map_err(|e| invalid(pool, e))
}

/// Fills in `serverIP`, `pool.start` and `pool.end` when left empty.
///
/// The server takes the first host address that is neither the router nor
/// excluded. The range defaults to every host address of the CIDR.
pub fn mutate_ippool(pool: &IPPool) -> Result<IPPool, WebhookError> {
    let parsed = parse(pool)?;
    let network = u32::from(parsed.network());
    let broadcast = u32::from(parsed.broadcast());
    let mut mutated = pool.clone();
    let ipv4 = &mut mutated.spec.ipv4;

    if parsed.server_ip.is_none() {
        let server_ip = (network.saturating_add(1)..broadcast)
            .map(Ipv4Addr::from)
            .find(|ip| parsed.router != Some(*ip) && !parsed.exclude.contains(ip))
            .ok_or_else(|| invalid(pool, "fail to assign ip for dhcp server"))?;
        ipv4.server_ip = server_ip.to_string();
    }

    let start = parsed.start.unwrap_or_else(|| Ipv4Addr::from(network.saturating_add(1)));
    let end = parsed.end.unwrap_or_else(|| Ipv4Addr::from(broadcast.saturating_sub(1)));
    if start > end {
        return Err(invalid(pool, format!("pool start {start} is after pool end {end}")));
    }
    if parsed.start.is_none() {
        ipv4.pool.start = start.to_string();
    }
    if parsed.end.is_none() {
        ipv4.pool.end = end.to_string();
    }
    Ok(mutated)
}

fn check_host_address(pool: &IPPool, parsed: &ParsedIPv4Config, field: &str, ip: Option<Ipv4Addr>) -> Result<(), WebhookError> {
    let Some(ip) = ip else {
        return Ok(());
    };
    if !parsed.cidr.contains(&ip) {
        return Err(invalid(pool, format!("{field} {ip} is not within subnet {}", parsed.cidr)));
    }
    if ip == parsed.network() {
        return Err(invalid(pool, format!("{field} {ip} is the network address")));
    }
    if ip == parsed.broadcast() {
        return Err(invalid(pool, format!("{field} {ip} is the broadcast address")));
    }
    Ok(())
}

/// Checks that need nothing but the object: field syntax, placement inside
/// the CIDR and overlap with the service CIDR.
pub fn check_ippool_spec(pool: &IPPool, service_cidr: Ipv4Net) -> Result<ParsedIPv4Config, WebhookError> {
    pool.network().map_err(|e| invalid(pool, e))?;
    let parsed = parse(pool)?;

    if parsed.cidr.contains(&service_cidr.network()) || service_cidr.contains(&parsed.cidr.network()) {
        return Err(invalid(
            pool,
            format!("cidr {} overlaps cluster service cidr {service_cidr}", parsed.cidr),
        ));
    }

    let Some(server_ip) = parsed.server_ip else {
        return Err(invalid(pool, "serverIP is not set"));
    };
    check_host_address(pool, &parsed, "serverIP", Some(server_ip))?;
    check_host_address(pool, &parsed, "router", parsed.router)?;
    check_host_address(pool, &parsed, "pool.start", parsed.start)?;
    check_host_address(pool, &parsed, "pool.end", parsed.end)?;

    if parsed.router == Some(server_ip) {
        return Err(invalid(pool, format!("serverIP {server_ip} cannot be the same as router")));
    }
    if let (Some(start), Some(end)) = (parsed.start, parsed.end) {
        if start > end {
            return Err(invalid(pool, format!("pool start {start} is after pool end {end}")));
        }
    }
    Ok(parsed)
}

/// Validates an IPPool create (`old` is `None`) or update.
pub async fn validate_ippool(
    client: &dyn ClusterClient,
    service_cidr: Ipv4Net,
    pool: &IPPool,
    old: Option<&IPPool>,
) -> Result<(), WebhookError> {
    let parsed = check_ippool_spec(pool, service_cidr)?;

    if let (Some(old), Some(server_ip)) = (old, parsed.server_ip) {
        let allocated = old.allocated();
        if let Some(mac) = allocated.get(&server_ip.to_string()).filter(|tag| !is_sentinel_tag(tag)) {
            return Err(invalid(pool, format!("serverIP {server_ip} is already allocated to {mac}")));
        }
    }

    let network = pool.network().map_err(|e| invalid(pool, e))?;
    if client
        .get_network_attachment_definition(&network.namespace, &network.name)
        .await?
        .is_none()
    {
        return Err(invalid(pool, format!("network attachment definition {network} not found")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::MockClusterClient;
    use crds::{IPPoolSpec, IPPoolStatus, IPv4Config, IPv4Status, Pool};
    use std::collections::BTreeMap;

    fn service_cidr() -> Ipv4Net {
        "10.53.0.0/16".parse().unwrap()
    }

    fn create_test_ip_pool(server_ip: &str, start: &str, end: &str) -> IPPool {
        IPPool::new(
            "net-1",
            IPPoolSpec {
                network_name: "default/net-1".to_string(),
                ipv4: IPv4Config {
                    server_ip: server_ip.to_string(),
                    cidr: "192.168.0.0/24".to_string(),
                    pool: Pool {
                        start: start.to_string(),
                        end: end.to_string(),
                        exclude: vec!["192.168.0.2".to_string()],
                    },
                    router: Some("192.168.0.1".to_string()),
                    ..Default::default()
                },
                paused: None,
            },
        )
    }

    #[test]
    fn test_mutate_fills_defaults() {
        let pool = create_test_ip_pool("", "", "");
        let mutated = mutate_ippool(&pool).unwrap();
        let ipv4 = &mutated.spec.ipv4;
        assert_eq!(ipv4.server_ip, "192.168.0.3", "router and excluded addresses are skipped");
        assert_eq!(ipv4.pool.start, "192.168.0.1");
        assert_eq!(ipv4.pool.end, "192.168.0.254");
    }

    #[test]
    fn test_mutate_keeps_explicit_values() {
        let pool = create_test_ip_pool("192.168.0.10", "192.168.0.100", "192.168.0.200");
        assert_eq!(mutate_ippool(&pool).unwrap().spec.ipv4, pool.spec.ipv4);
    }

    #[test]
    fn test_mutate_rejects_bad_input() {
        let reversed = create_test_ip_pool("", "192.168.0.200", "192.168.0.100");
        assert!(matches!(mutate_ippool(&reversed), Err(WebhookError::ValidationFailed(_))));

        let mut tiny = create_test_ip_pool("", "", "");
        tiny.spec.ipv4.cidr = "192.168.0.0/30".to_string();
        assert!(matches!(mutate_ippool(&tiny), Err(WebhookError::ValidationFailed(_))));
    }

    #[test]
    fn test_check_spec() {
        let ok = create_test_ip_pool("192.168.0.10", "192.168.0.100", "192.168.0.200");
        assert!(check_ippool_spec(&ok, service_cidr()).is_ok());

        let cases = [
            create_test_ip_pool("192.168.1.10", "192.168.0.100", "192.168.0.200"),
            create_test_ip_pool("192.168.0.255", "192.168.0.100", "192.168.0.200"),
            create_test_ip_pool("192.168.0.1", "192.168.0.100", "192.168.0.200"),
            create_test_ip_pool("192.168.0.10", "192.168.0.0", "192.168.0.200"),
            create_test_ip_pool("192.168.0.10", "192.168.0.200", "192.168.0.100"),
            create_test_ip_pool("", "192.168.0.100", "192.168.0.200"),
        ];
        for pool in &cases {
            assert!(
                matches!(check_ippool_spec(pool, service_cidr()), Err(WebhookError::ValidationFailed(_))),
                "{:?} should be rejected",
                pool.spec.ipv4
            );
        }

        let mut overlapping = ok.clone();
        overlapping.spec.ipv4.cidr = "10.53.0.0/24".to_string();
        overlapping.spec.ipv4.server_ip = "10.53.0.2".to_string();
        overlapping.spec.ipv4.router = None;
        overlapping.spec.ipv4.pool = Pool::default();
        let err = check_ippool_spec(&overlapping, service_cidr()).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[tokio::test]
    async fn test_validate_requires_network_attachment() {
        let client = MockClusterClient::new();
        let pool = create_test_ip_pool("192.168.0.10", "192.168.0.100", "192.168.0.200");

        let err = validate_ippool(&client, service_cidr(), &pool, None).await.unwrap_err();
        assert!(err.to_string().contains("not found"));

        client.add_network_attachment_definition("default", "net-1");
        validate_ippool(&client, service_cidr(), &pool, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_update_rejects_allocated_server_ip() {
        let client = MockClusterClient::new();
        client.add_network_attachment_definition("default", "net-1");
        let mut old = create_test_ip_pool("192.168.0.10", "192.168.0.100", "192.168.0.200");
        old.status = Some(IPPoolStatus {
            ipv4: Some(IPv4Status {
                allocated: BTreeMap::from([
                    ("192.168.0.10".to_string(), "RESERVED".to_string()),
                    ("192.168.0.150".to_string(), "aa:bb:cc:dd:ee:01".to_string()),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        });

        let unchanged = old.clone();
        validate_ippool(&client, service_cidr(), &unchanged, Some(&old)).await.unwrap();

        let mut moved = old.clone();
        moved.spec.ipv4.server_ip = "192.168.0.150".to_string();
        let err = validate_ippool(&client, service_cidr(), &moved, Some(&old)).await.unwrap_err();
        assert!(err.to_string().contains("already allocated"));
    }
}
