//! Kubernetes resource watchers.
//!
//! This module handles watching Kubernetes resources for changes
//! and triggering reconciliation using kube_runtime::Controller.
//!
//! All watchers go through `watch_resource()`, which wires the shared
//! reconciler, the per-key backoff and the logging around one
//! `kube_runtime::Controller`. The controller guarantees that two events
//! for the same object are never reconciled concurrently.

use crate::reconciler::Reconciler;
use crate::error::ControllerError;
use crds::labels::{IPPOOL_NAME_LABEL_KEY, agent_selector};
use crds::{IPPool, VirtualMachine, VirtualMachineNetworkConfig};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher, controller::{Action, Config as ControllerConfig}};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Work-queue key of an object: `Kind/name` or `Kind/namespace/name`.
pub fn object_key<K: Resource>(kind: &str, obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{kind}/{ns}/{}", obj.name_any()),
        None => format!("{kind}/{}", obj.name_any()),
    }
}

/// Runs `controller` until it shuts down.
///
/// Failed reconciles are requeued with the reconciler's per-key exponential
/// backoff; errors that no retry will fix, and keys whose retry budget is
/// spent, wait for the next change event instead.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = object_key(resource_name, obj.as_ref());
        match ctx.retry_after(&key, error) {
            Some(delay) => {
                warn!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, error);
                Action::requeue(delay)
            }
            None => {
                error!("Reconciliation of {} failed, not retrying: {}", key, error);
                Action::await_change()
            }
        }
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = object_key(resource_name, obj.as_ref());
            debug!("Dispatching {}", key);
            let action = reconcile_fn(ctx.clone(), obj).await?;
            ctx.record_success(&key);
            Ok::<_, ControllerError>(action)
        }
    };

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("Controller event for {}: {}", resource_name, e);
            }
        })
        .await;

    info!("{} watcher stopped", resource_name);
    Ok(())
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    config: ControllerConfig,
}

impl Watcher {
    /// Creates a new watcher instance running up to `threadiness`
    /// reconciles per resource kind at once.
    pub fn new(reconciler: Arc<Reconciler>, client: Client, threadiness: u16) -> Self {
        Self {
            reconciler,
            client,
            config: ControllerConfig::default().concurrency(threadiness),
        }
    }

    /// Watches IPPools, and agent pods on behalf of their pool.
    pub async fn watch_ippools(&self) -> Result<(), ControllerError> {
        let ippools: Api<IPPool> = Api::all(self.client.clone());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.reconciler.agent.namespace);
        let controller = Controller::new(ippools, watcher::Config::default())
            .with_config(self.config.clone())
            .watches(
                pods,
                watcher::Config::default().labels(&agent_selector()),
                |pod: Pod| {
                    pod.labels()
                        .get(IPPOOL_NAME_LABEL_KEY)
                        .map(|name| ObjectRef::<IPPool>::new(name))
                },
            );
        watch_resource(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_ippool(&resource).await }),
            "IPPool",
        )
        .await
    }

    /// Watches VirtualMachineNetworkConfigs in all namespaces.
    pub async fn watch_vmnetcfgs(&self) -> Result<(), ControllerError> {
        let vmnetcfgs: Api<VirtualMachineNetworkConfig> = Api::all(self.client.clone());
        let controller = Controller::new(vmnetcfgs, watcher::Config::default()).with_config(self.config.clone());
        watch_resource(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_vmnetcfg(&resource).await }),
            "VirtualMachineNetworkConfig",
        )
        .await
    }

    /// Watches VirtualMachines and the configs derived from them.
    pub async fn watch_vms(&self) -> Result<(), ControllerError> {
        let vms: Api<VirtualMachine> = Api::all(self.client.clone());
        let owned: Api<VirtualMachineNetworkConfig> = Api::all(self.client.clone());
        let controller = Controller::new(vms, watcher::Config::default())
            .with_config(self.config.clone())
            .owns(owned, watcher::Config::default());
        watch_resource(
            controller,
            self.reconciler.clone(),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_vm(&resource).await }),
            "VirtualMachine",
        )
        .await
    }
}
