//! AdmissionReview endpoints.
//!
//! One route per resource and action. Requests from the controller and the
//! garbage collector bypass validation so cleanup is never blocked by a rule
//! the object no longer satisfies.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use cluster_client::ClusterClient;
use crds::{IPPool, VirtualMachineNetworkConfig};
use ipnet::Ipv4Net;
use k8s_openapi::api::authentication::v1::UserInfo;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Resource;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::error::WebhookError;
use crate::ippool::{mutate_ippool, validate_ippool};
use crate::vmnetcfg::validate_vmnetcfg;

type ReviewResponse = Json<AdmissionReview<DynamicObject>>;

/// Shared handler state.
#[derive(Clone)]
pub struct WebhookState {
    /// Cluster reads for cross-object checks
    pub client: Arc<dyn ClusterClient>,
    /// Cluster service CIDR pools must not overlap
    pub service_cidr: Ipv4Net,
    /// Usernames whose requests are never validated
    pub bypass_users: Arc<Vec<String>>,
}

impl std::fmt::Debug for WebhookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookState")
            .field("service_cidr", &self.service_cidr)
            .field("bypass_users", &self.bypass_users)
            .finish_non_exhaustive()
    }
}

impl WebhookState {
    fn bypasses(&self, user: &UserInfo) -> bool {
        user.username
            .as_deref()
            .is_some_and(|name| self.bypass_users.iter().any(|u| u == name))
    }
}

/// Builds the admission router, serving at most `threadiness` reviews at once.
pub fn router(state: WebhookState, threadiness: usize) -> Router {
    Router::new()
        .route("/v1/webhook/mutation/ippools", post(mutate_ippools))
        .route("/v1/webhook/validation/ippools", post(validate_ippools))
        .route("/v1/webhook/validation/vmnetcfgs", post(validate_vmnetcfgs))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(ConcurrencyLimitLayer::new(threadiness.max(1))),
        )
        .with_state(state)
}

fn into_request<K: Resource>(review: AdmissionReview<K>) -> Result<AdmissionRequest<K>, ReviewResponse> {
    review.try_into().map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
        error!(error = %e, "Malformed AdmissionReview");
        Json(AdmissionResponse::invalid(e.to_string()).into_review())
    })
}

fn decide(resp: AdmissionResponse, result: Result<(), WebhookError>) -> AdmissionResponse {
    match result {
        Ok(()) => resp,
        Err(WebhookError::ValidationFailed(reason)) => {
            info!(reason = %reason, "Admission denied");
            resp.deny(reason)
        }
        Err(e) => {
            error!(error = %e, "Admission check failed");
            resp.deny(e.to_string())
        }
    }
}

/// Attaches the JSON patch turning `original` into `mutated`, if any.
fn with_mutation(resp: AdmissionResponse, original: &IPPool, mutated: &IPPool) -> AdmissionResponse {
    let (Ok(before), Ok(after)) = (serde_json::to_value(original), serde_json::to_value(mutated)) else {
        return resp.deny("failed to serialize ippool");
    };
    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        return resp;
    }
    debug!(patch = ?patch, "Mutating ippool");
    resp.with_patch(patch)
        .unwrap_or_else(|e| AdmissionResponse::invalid(e.to_string()))
}

async fn mutate_ippools(Json(review): Json<AdmissionReview<IPPool>>) -> ReviewResponse {
    let req = match into_request(review) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let resp = AdmissionResponse::from(&req);
    let resp = match (&req.operation, req.object.as_ref()) {
        (Operation::Create, Some(pool)) => match mutate_ippool(pool) {
            Ok(mutated) => with_mutation(resp, pool, &mutated),
            Err(e) => decide(resp, Err(e)),
        },
        _ => resp,
    };
    Json(resp.into_review())
}

async fn validate_ippools(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<IPPool>>,
) -> ReviewResponse {
    let req = match into_request(review) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let resp = AdmissionResponse::from(&req);
    if state.bypasses(&req.user_info) {
        return Json(resp.into_review());
    }
    let client = state.client.as_ref();
    let result = match (&req.operation, req.object.as_ref()) {
        (Operation::Create, Some(pool)) => validate_ippool(client, state.service_cidr, pool, None).await,
        (Operation::Update, Some(pool)) => {
            validate_ippool(client, state.service_cidr, pool, req.old_object.as_ref()).await
        }
        _ => Ok(()),
    };
    Json(decide(resp, result).into_review())
}

async fn validate_vmnetcfgs(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<VirtualMachineNetworkConfig>>,
) -> ReviewResponse {
    let req = match into_request(review) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let resp = AdmissionResponse::from(&req);
    if state.bypasses(&req.user_info) {
        return Json(resp.into_review());
    }
    let result = match (&req.operation, req.object.as_ref()) {
        (Operation::Create, Some(cfg)) => validate_vmnetcfg(state.client.as_ref(), cfg).await,
        _ => Ok(()),
    };
    Json(decide(resp, result).into_review())
}
