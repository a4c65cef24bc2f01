//! HTTP handlers for the health endpoint

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::instrument;

use super::dto::HealthResponse;
use super::server::ServerState;

/// Liveness: the process is serving
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse::new("healthy"))
}

/// Readiness: caches have synced and workers are running
#[instrument(skip(state))]
pub async fn readyz(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<HealthResponse>) {
    if state.is_ready() {
        (StatusCode::OK, Json(HealthResponse::new("ready")))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::new("initializing")),
        )
    }
}

/// Prometheus text exposition of the controller metrics
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}
