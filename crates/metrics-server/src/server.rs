//! HTTP surface shared by the controller, agent and webhook processes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::dump::{DebugDumps, Dumper};
use crate::error::MetricsError;
use crate::metrics::Metrics;

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Registered gauges
    pub metrics: Arc<Metrics>,
    /// Flipped once the process is ready to serve
    pub ready: Arc<AtomicBool>,
    /// Optional cache-dump sources
    pub dumps: DebugDumps,
}

impl AppState {
    /// State with no dump routes and readiness unset.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
            dumps: DebugDumps::default(),
        }
    }

    /// Marks the process ready (or not).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

/// Builds the router for probes, metrics and dumps.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/ipams/{*network}", get(ipam_dump))
        .route("/caches/{*network}", get(cache_dump))
        .route("/leases", get(lease_dump))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serves `router` on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, router: Router, shutdown: F) -> Result<(), MetricsError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn readyz(State(state): State<AppState>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        Json(json!({ "ok": true })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ok": false }))).into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn dump(source: Option<&Arc<dyn Dumper>>, filter: Option<&str>) -> Response {
    match source {
        Some(d) => Json(d.list_all(filter)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ipam_dump(State(state): State<AppState>, Path(network): Path<String>) -> Response {
    dump(state.dumps.ipam.as_ref(), Some(&network))
}

async fn cache_dump(State(state): State<AppState>, Path(network): Path<String>) -> Response {
    dump(state.dumps.cache.as_ref(), Some(&network))
}

async fn lease_dump(State(state): State<AppState>) -> Response {
    dump(state.dumps.leases.as_ref(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use ipam::IpAllocator;
    use tower::ServiceExt;

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn state() -> AppState {
        AppState::new(Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn test_probes() {
        let state = state();
        let (status, body) = get_path(router(state.clone()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"ok":true}"#);

        let (status, _) = get_path(router(state.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        let (status, _) = get_path(router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = state();
        state.metrics.update_ippool("net-1", "10.0.0.0/24", "default/net-1", 2, 10);
        let (status, body) = get_path(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("vmdhcpcontroller_ippool_available"));
    }

    #[tokio::test]
    async fn test_dump_routes() {
        let mut state = state();
        let (status, _) = get_path(router(state.clone()), "/leases").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let ipam = Arc::new(IpAllocator::new());
        ipam.new_subnet("default/net-1", "10.0.0.0/29", "10.0.0.2".parse().unwrap(), "10.0.0.6".parse().unwrap())
            .unwrap();
        ipam.allocate_ip("default/net-1", "10.0.0.3".parse().unwrap()).unwrap();
        state.dumps.ipam = Some(ipam as Arc<dyn Dumper>);

        let (status, body) = get_path(router(state), "/ipams/default/net-1").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["default/net-1"]["10.0.0.3"], "allocated");
    }
}
