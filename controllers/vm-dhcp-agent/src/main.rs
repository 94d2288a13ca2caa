//! VM DHCP Agent
//!
//! Runs inside the agent pod of one IPPool. Mirrors the pool's allocation
//! map into a lease table and answers DHCP on the interface facing the
//! pool's network.

mod config;
mod controller;
mod error;
mod reconciler;
mod watcher;

#[cfg(test)]
mod reconciler_test;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use cluster_client::LeaderElector;
use config::AgentConfig;
use controller::{Agent, Settings};
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line configuration of the agent.
#[derive(Debug, Parser)]
#[command(name = "vm-dhcp-agent", version, about = "VM DHCP agent")]
struct Cli {
    /// Log at debug level
    #[arg(long, env = "VM_DHCP_AGENT_DEBUG")]
    debug: bool,

    /// Log at trace level
    #[arg(long, env = "VM_DHCP_AGENT_TRACE")]
    trace: bool,

    /// Name of this agent, also the leader lease name
    #[arg(long, env = "VM_DHCP_AGENT_NAME", default_value = "vm-dhcp-agent")]
    name: String,

    /// Sync leases without serving DHCP
    #[arg(long)]
    dry_run: bool,

    /// Run without leader election
    #[arg(long)]
    no_leader_election: bool,

    /// Serve the lease table on /leases
    #[arg(long)]
    enable_cache_dump_api: bool,

    /// Kubeconfig file; `KUBECONFIG` or in-cluster configuration when absent
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    kubecontext: Option<String>,

    /// Namespace of the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

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

async fn kube_client(kubeconfig: Option<PathBuf>, context: Option<String>) -> anyhow::Result<Client> {
    let options = KubeConfigOptions {
        context,
        ..Default::default()
    };
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None if options.context.is_some() => kube::Config::from_kubeconfig(&options).await?,
        None => kube::Config::infer().await?,
    };
    Client::try_from(config).context("failed to create Kubernetes client")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.trace);

    info!("Starting VM DHCP Agent");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;

    let config = AgentConfig::from_env()?;
    info!("Configuration:");
    info!("  Name: {}", cli.name);
    info!("  IPPools: {:?}", config.ippools.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    info!("  Dry run: {}", cli.dry_run);

    let client = kube_client(cli.kubeconfig, cli.kubecontext).await?;

    let leader = if cli.no_leader_election {
        None
    } else {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("{}-{}", cli.name, std::process::id()));
        Some(LeaderElector::new(client.clone(), &cli.namespace, &cli.name, &identity))
    };

    let settings = Settings {
        config,
        dry_run: cli.dry_run,
        http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.http_port)),
        enable_cache_dump_api: cli.enable_cache_dump_api,
    };

    let agent = Agent::new(client, settings, leader).await?;
    agent.run().await?;

    Ok(())
}
