//! Agent wiring: lease table, DHCP servers, probes and the IPPool watcher.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use cluster_client::{KubeClusterClient, LeaderElector};
use dhcp_server::{DhcpServerSet, LeaseTable};
use kube::Client;
use metrics_server::{AppState, Dumper, Metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Runtime settings of the agent process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Pools and interfaces served
    pub config: AgentConfig,
    /// Sync leases without serving DHCP
    pub dry_run: bool,
    /// Address of the probe and metrics server
    pub http_addr: SocketAddr,
    /// Expose the lease table over HTTP
    pub enable_cache_dump_api: bool,
}

/// The running agent.
pub struct Agent {
    ippool_watcher: JoinHandle<Result<(), AgentError>>,
    http_server: JoinHandle<Result<(), AgentError>>,
    servers: Arc<DhcpServerSet>,
    leader: Option<Arc<LeaderElector>>,
}

impl Agent {
    /// Starts the HTTP server, waits for leadership when enabled and starts
    /// watching the served pools. Readiness follows the first lease sync.
    pub async fn new(client: Client, settings: Settings, leader: Option<LeaderElector>) -> Result<Self, AgentError> {
        info!("Initializing VM DHCP Agent");

        let leases = Arc::new(LeaseTable::new());
        let servers = Arc::new(DhcpServerSet::new(leases.clone()));

        let mut state = AppState::new(Arc::new(Metrics::new()?));
        if settings.enable_cache_dump_api {
            info!("Cache dump API enabled");
            state.dumps.leases = Some(leases as Arc<dyn Dumper>);
        }
        let http_addr = settings.http_addr;
        let router = metrics_server::router(state.clone());
        let http_server = tokio::spawn(async move {
            metrics_server::serve(http_addr, router, metrics_server::shutdown_signal())
                .await
                .map_err(AgentError::from)
        });

        let leader = leader.map(Arc::new);
        if let Some(elector) = &leader {
            elector.acquire().await?;
        }

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeClusterClient::new(client.clone())),
            servers.clone(),
            settings.config,
            settings.dry_run,
            state,
        ));
        let watcher = Watcher::new(reconciler, client);
        let ippool_watcher = tokio::spawn(async move { watcher.watch_ippools().await });

        Ok(Self {
            ippool_watcher,
            http_server,
            servers,
            leader,
        })
    }

    /// Runs until the watcher stops or leadership is lost, then closes every
    /// DHCP socket.
    pub async fn run(mut self) -> Result<(), AgentError> {
        info!("VM DHCP Agent running");

        let result = tokio::select! {
            result = &mut self.ippool_watcher => task_result("IPPool watcher", result),
            result = &mut self.http_server => task_result("HTTP server", result),
            err = hold_leadership(self.leader.clone()) => Err(err),
        };

        self.servers.stop_all().await;
        match &result {
            Ok(()) => info!("VM DHCP Agent stopped"),
            Err(e) => error!("VM DHCP Agent stopped: {}", e),
        }
        result
    }
}

fn task_result(
    name: &str,
    result: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(AgentError::Watch(format!("{} panicked: {}", name, e))),
    }
}

async fn hold_leadership(leader: Option<Arc<LeaderElector>>) -> AgentError {
    match leader {
        Some(elector) => AgentError::Fatal(format!("leadership lost: {}", elector.hold().await)),
        None => std::future::pending().await,
    }
}
