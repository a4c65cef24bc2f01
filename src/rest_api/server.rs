//! Axum HTTP server for health, readiness and metrics

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{Error, Result};

use super::handlers;

pub const DEFAULT_PORT: u16 = 8080;

/// State shared between the controller and the HTTP handlers
#[derive(Debug, Default)]
pub struct ServerState {
    /// Flipped once every cache has synced
    pub ready: Arc<Mutex<bool>>,
}

impl ServerState {
    pub fn new(ready: Arc<Mutex<bool>>) -> Self {
        Self { ready }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.lock().map(|ready| *ready).unwrap_or(false)
    }
}

fn router(state: Arc<ServerState>) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the health endpoint until the process exits
pub async fn run_server(state: Arc<ServerState>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health endpoint listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
