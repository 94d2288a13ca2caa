//! VM DHCP Webhook
//!
//! Admission webhook for the VM DHCP resources:
//! - IPPool: defaults serverIP and the pool range, validates addresses
//! - VirtualMachineNetworkConfig: every network must have an IPPool

mod error;
mod ippool;
mod server;
mod service_cidr;
mod vmnetcfg;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use cluster_client::KubeClusterClient;
use error::WebhookError;
use ipnet::Ipv4Net;
use kube::Client;
use metrics_server::{AppState, Metrics};
use server::WebhookState;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Grace period for in-flight reviews on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Command-line configuration of the webhook.
#[derive(Debug, Parser)]
#[command(name = "vm-dhcp-webhook", version, about = "VM DHCP admission webhook")]
struct Cli {
    /// Log at debug level
    #[arg(long, env = "VM_DHCP_WEBHOOK_DEBUG")]
    debug: bool,

    /// Log at trace level
    #[arg(long, env = "VM_DHCP_WEBHOOK_TRACE")]
    trace: bool,

    /// HTTPS port of the admission endpoints
    #[arg(long, default_value_t = 8443)]
    https_port: u16,

    /// Namespace the webhook and the controller run in
    #[arg(long, env = "NAMESPACE", default_value = "harvester-system")]
    namespace: String,

    /// Service CIDR used when no node records one
    #[arg(long, default_value = "10.53.0.0/16")]
    service_cidr: Ipv4Net,

    /// Reviews handled concurrently
    #[arg(long, default_value_t = 5)]
    threadiness: usize,

    /// Username of the controller; defaults to its service account
    #[arg(long)]
    controller_user: Option<String>,

    /// Username of the garbage collector
    #[arg(long, default_value = "system:serviceaccount:kube-system:generic-garbage-collector")]
    gc_user: String,

    /// Serving certificate (PEM)
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt")]
    tls_cert_file: PathBuf,

    /// Serving key (PEM)
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key")]
    tls_key_file: PathBuf,
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

    info!("Starting VM DHCP Webhook");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;

    let controller_user = cli
        .controller_user
        .unwrap_or_else(|| format!("system:serviceaccount:{}:vm-dhcp-controller", cli.namespace));
    info!("Configuration:");
    info!("  Namespace: {}", cli.namespace);
    info!("  HTTPS port: {}", cli.https_port);
    info!("  Threadiness: {}", cli.threadiness);
    info!("  Bypassing: {}, {}", controller_user, cli.gc_user);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster = Arc::new(KubeClusterClient::new(client));
    let service_cidr = service_cidr::discover_service_cidr(cluster.as_ref(), cli.service_cidr).await;

    let tls = RustlsConfig::from_pem_file(&cli.tls_cert_file, &cli.tls_key_file)
        .await
        .map_err(|e| {
            WebhookError::InvalidConfig(format!(
                "failed to load serving certificate {}: {e}",
                cli.tls_cert_file.display()
            ))
        })?;

    let probes = AppState::new(Arc::new(Metrics::new().map_err(WebhookError::from)?));
    let state = WebhookState {
        client: cluster,
        service_cidr,
        bypass_users: Arc::new(vec![controller_user, cli.gc_user]),
    };
    let app = server::router(state, cli.threadiness).merge(metrics_server::router(probes.clone()));

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        metrics_server::shutdown_signal().await;
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.https_port));
    info!(%addr, "Serving admission reviews");
    probes.set_ready(true);
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(WebhookError::from)?;

    info!("VM DHCP Webhook stopped");
    Ok(())
}
