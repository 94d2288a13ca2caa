//! IPPool watcher.
//!
//! Runs one `kube_runtime::Controller` over IPPools; pools this agent does
//! not serve are skipped by the reconciler.

use crate::error::AgentError;
use crate::reconciler::Reconciler;
use crds::IPPool;
use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{Controller, watcher, controller::Action};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Delay before retrying a failed sync
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Watches the IPPools served by this agent.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, client: Client) -> Self {
        Self { reconciler, client }
    }

    /// Runs until the process is signalled to stop.
    pub async fn watch_ippools(&self) -> Result<(), AgentError> {
        info!("Starting IPPool watcher");
        let api: Api<IPPool> = Api::all(self.client.clone());

        let error_policy = |obj: Arc<IPPool>, error: &AgentError, _ctx: Arc<Reconciler>| {
            error!("Lease sync failed for IPPool {}: {}", obj.name_any(), error);
            Action::requeue(RETRY_DELAY)
        };

        let reconcile = |obj: Arc<IPPool>, ctx: Arc<Reconciler>| async move { ctx.reconcile_ippool(&obj).await };

        Controller::new(api, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                if let Err(e) = res {
                    debug!("Controller event for IPPool: {}", e);
                }
            })
            .await;

        info!("IPPool watcher stopped");
        Ok(())
    }
}
