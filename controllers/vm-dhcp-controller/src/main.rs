//! VM DHCP Controller
//!
//! Leader-elected controller that turns IPPools into allocatable subnets and
//! per-pool DHCP agents, and binds every VM NIC on a managed network to an
//! address:
//! - IPPool: installs the subnet, replays allocations, deploys the agent
//! - VirtualMachineNetworkConfig: allocates NIC addresses and records them
//! - VirtualMachine: derives the VirtualMachineNetworkConfig of each VM

mod backoff;
mod controller;
mod error;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use cluster_client::LeaderElector;
use controller::{Controller, Settings};
use kube::Client;
use reconciler::AgentSettings;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line configuration of the controller.
#[derive(Debug, Parser)]
#[command(name = "vm-dhcp-controller", version, about = "VM DHCP controller")]
struct Cli {
    /// Log at debug level
    #[arg(long, env = "VM_DHCP_CONTROLLER_DEBUG")]
    debug: bool,

    /// Log at trace level
    #[arg(long, env = "VM_DHCP_CONTROLLER_TRACE")]
    trace: bool,

    /// Name of this controller, also the leader lease name
    #[arg(long, env = "VM_DHCP_CONTROLLER_NAME", default_value = "vm-dhcp-controller")]
    name: String,

    /// Run without leader election
    #[arg(long)]
    no_leader_election: bool,

    /// Serve the in-memory allocators on /ipams, /caches and /leases
    #[arg(long)]
    enable_cache_dump_api: bool,

    /// Namespace agent pods and the leader lease live in
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Image of the agent pods
    #[arg(long, env = "AGENT_IMAGE", default_value = "rancher/harvester-vm-dhcp-agent:main-head")]
    agent_image: String,

    /// Service account of the agent pods
    #[arg(long, env = "AGENT_SERVICE_ACCOUNT")]
    agent_service_account: Option<String>,

    /// Concurrent reconciles per resource kind
    #[arg(long, default_value_t = 5)]
    threadiness: u16,

    /// Port of the probe and metrics server
    #[arg(long, default_value_t = 8080)]
    http_port: u16,
}

fn init_tracing(debug: bool, trace: bool) {
    let level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.trace);

    info!("Starting VM DHCP Controller");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;

    let threadiness = cli.threadiness.clamp(1, 5);
    info!("Configuration:");
    info!("  Name: {}", cli.name);
    info!("  Namespace: {}", cli.namespace);
    info!("  Agent image: {}", cli.agent_image);
    info!("  Threadiness: {}", threadiness);
    info!("  Leader election: {}", !cli.no_leader_election);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let leader = if cli.no_leader_election {
        None
    } else {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("{}-{}", cli.name, std::process::id()));
        Some(LeaderElector::new(client.clone(), &cli.namespace, &cli.name, &identity))
    };

    let settings = Settings {
        agent: AgentSettings {
            namespace: cli.namespace,
            image: cli.agent_image,
            service_account: cli.agent_service_account,
        },
        threadiness,
        http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.http_port)),
        enable_cache_dump_api: cli.enable_cache_dump_api,
    };

    let controller = Controller::new(client, settings, leader).await?;
    controller.run().await?;

    Ok(())
}
