//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the shared
//! allocators to the cluster and runs the watchers.
//!
//! The controller manages three resource types:
//! - IPPool: subnet install, status replay and the per-pool DHCP agent
//! - VirtualMachineNetworkConfig: per-NIC address allocation
//! - VirtualMachine: derives the VirtualMachineNetworkConfig of each VM

use crate::error::ControllerError;
use crate::reconciler::{AgentSettings, Reconciler};
use crate::watcher::Watcher;
use cluster_client::{KubeClusterClient, LeaderElector};
use dhcp_server::LeaseTable;
use ipam::{CacheAllocator, IpAllocator};
use kube::Client;
use metrics_server::{AppState, Dumper, Metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runtime settings of the controller process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How agent pods are built
    pub agent: AgentSettings,
    /// Concurrent reconciles per resource kind
    pub threadiness: u16,
    /// Address of the probe and metrics server
    pub http_addr: SocketAddr,
    /// Expose the in-memory allocators over HTTP
    pub enable_cache_dump_api: bool,
}

/// Main controller for VM DHCP resources.
pub struct Controller {
    ippool_watcher: JoinHandle<Result<(), ControllerError>>,
    vmnetcfg_watcher: JoinHandle<Result<(), ControllerError>>,
    vm_watcher: JoinHandle<Result<(), ControllerError>>,
    http_server: JoinHandle<Result<(), ControllerError>>,
    leader: Option<Arc<LeaderElector>>,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// The HTTP server comes up first so liveness holds while waiting for
    /// leadership. Readiness is only reported once every IPPool has been
    /// replayed into the allocators and the watchers are running.
    pub async fn new(
        client: Client,
        settings: Settings,
        leader: Option<LeaderElector>,
    ) -> Result<Self, ControllerError> {
        info!("Initializing VM DHCP Controller");

        let ipam = Arc::new(IpAllocator::new());
        let cache = Arc::new(CacheAllocator::new());
        let leases = Arc::new(LeaseTable::new());
        let metrics = Arc::new(Metrics::new()?);

        let mut state = AppState::new(metrics.clone());
        if settings.enable_cache_dump_api {
            info!("Cache dump API enabled");
            state.dumps.ipam = Some(ipam.clone() as Arc<dyn Dumper>);
            state.dumps.cache = Some(cache.clone() as Arc<dyn Dumper>);
            state.dumps.leases = Some(leases.clone() as Arc<dyn Dumper>);
        }
        let http_addr = settings.http_addr;
        let router = metrics_server::router(state.clone());
        let http_server = tokio::spawn(async move {
            metrics_server::serve(http_addr, router, metrics_server::shutdown_signal())
                .await
                .map_err(ControllerError::from)
        });

        let leader = leader.map(Arc::new);
        if let Some(elector) = &leader {
            elector.acquire().await?;
        }

        let cluster = Arc::new(KubeClusterClient::new(client.clone()));
        let reconciler = Arc::new(Reconciler::new(
            cluster,
            ipam,
            cache,
            leases,
            metrics,
            settings.agent,
        ));

        // Allocations must be rebuilt before any VMNetCfg is looked at
        info!("Replaying IPPool status into the allocators...");
        reconciler.startup_replay().await?;
        info!("Startup replay completed");

        let watcher_instance = Arc::new(Watcher::new(reconciler, client, settings.threadiness));

        let watcher = watcher_instance.clone();
        let ippool_watcher = tokio::spawn(async move { watcher.watch_ippools().await });
        let watcher = watcher_instance.clone();
        let vmnetcfg_watcher = tokio::spawn(async move { watcher.watch_vmnetcfgs().await });
        let watcher = watcher_instance;
        let vm_watcher = tokio::spawn(async move { watcher.watch_vms().await });

        state.set_ready(true);
        info!("VM DHCP Controller initialized");

        Ok(Self {
            ippool_watcher,
            vmnetcfg_watcher,
            vm_watcher,
            http_server,
            leader,
        })
    }

    /// Runs the controller until a watcher stops or leadership is lost.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("VM DHCP Controller running");

        let result = tokio::select! {
            result = &mut self.ippool_watcher => watcher_result("IPPool", result),
            result = &mut self.vmnetcfg_watcher => watcher_result("VirtualMachineNetworkConfig", result),
            result = &mut self.vm_watcher => watcher_result("VirtualMachine", result),
            result = &mut self.http_server => watcher_result("HTTP server", result),
            err = hold_leadership(self.leader.clone()) => Err(err),
        };

        match &result {
            Ok(()) => info!("VM DHCP Controller stopped"),
            Err(e) => error!("VM DHCP Controller stopped: {}", e),
        }
        result
    }
}

fn watcher_result(
    name: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!("{} watcher error: {}", name, e);
            Err(e)
        }
        Err(e) => Err(ControllerError::Watch(format!("{} watcher panicked: {}", name, e))),
    }
}

/// Renews the leader lease forever; resolves only once it is lost.
async fn hold_leadership(leader: Option<Arc<LeaderElector>>) -> ControllerError {
    match leader {
        Some(elector) => {
            let err = elector.hold().await;
            ControllerError::Fatal(format!("leadership lost: {err}"))
        }
        None => std::future::pending().await,
    }
}
