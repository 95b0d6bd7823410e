//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::{api::Api, ResourceExt};
use tracing::{error, instrument};

use crate::controller::conditions::{is_condition_true, CONDITION_TYPE_READY};
use crate::controller::ControllerState;
use crate::crd::VpnGw;

use super::dto::{
    ErrorResponse, HealthResponse, VpnGwDetailResponse, VpnGwListResponse, VpnGwSummary,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Liveness: the process is up
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: this replica is reconciling
#[instrument(skip(state))]
pub async fn readyz(
    State(state): State<Arc<ControllerState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = if state.is_leader() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "standby")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

fn summarize(gw: &VpnGw) -> VpnGwSummary {
    VpnGwSummary {
        name: gw.name_any(),
        namespace: gw.namespace().unwrap_or_default(),
        keepalived: gw.spec.keepalived.clone(),
        workload_type: gw.spec.workload_type,
        enable_ssl_vpn: gw.spec.enable_ssl_vpn,
        enable_ipsec_vpn: gw.spec.enable_ipsec_vpn,
        ready: gw
            .status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_TYPE_READY)),
        ipsec_connections: gw.active_connections().len(),
    }
}

/// List the VpnGws in the watched scope
#[instrument(skip(state))]
pub async fn list_vpn_gws(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<VpnGwListResponse>, ApiError> {
    let api: Api<VpnGw> = match &state.config.watch_namespace {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };

    match api.list(&Default::default()).await {
        Ok(gateways) => {
            let items: Vec<VpnGwSummary> = gateways.items.iter().map(summarize).collect();
            let total = items.len();
            Ok(Json(VpnGwListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list vpn gws: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get one VpnGw with its full status
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_vpn_gw(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<VpnGwDetailResponse>, ApiError> {
    let api: Api<VpnGw> = Api::namespaced(state.client.clone(), &namespace);

    match api.get_opt(&name).await {
        Ok(Some(gw)) => Ok(Json(VpnGwDetailResponse {
            name: gw.name_any(),
            namespace: gw.namespace().unwrap_or_default(),
            status: gw.status.clone().unwrap_or_default(),
            created_at: gw.metadata.creation_timestamp.map(|t| t.0.to_rfc3339()),
        })),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("VpnGw {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get vpn gw {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
