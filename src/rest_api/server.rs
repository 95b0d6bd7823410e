//! Axum HTTP server for health, metrics and the REST API

use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(feature = "metrics")]
use axum::http::StatusCode;
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

pub fn router(state: Arc<ControllerState>) -> Router {
    let router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/api/v1/vpngws", get(handlers::list_vpn_gws))
        .route("/api/v1/vpngws/{namespace}/{name}", get(handlers::get_vpn_gw));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server
pub async fn run_server(state: Arc<ControllerState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind {addr}: {e}")))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("REST API server failed: {e}")))?;
    Ok(())
}
