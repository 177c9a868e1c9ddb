//! Health, readiness and metrics endpoints
//!
//! `/healthz` and `/readyz` answer from the health registry the watch
//! supervisor reports into, including the watch state of every connected
//! cluster. `/metrics` exposes the process-wide Prometheus registry.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use podstat_lib::health::HealthRegistry;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub health: HealthRegistry,
}

impl AppState {
    pub fn new(health: HealthRegistry) -> Self {
        Self { health }
    }
}

fn respond<T: Serialize>(passing: bool, body: T) -> Response {
    let status = if passing {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// 200 while healthy or degraded
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health.health().await;
    respond(health.status.is_operational(), health)
}

/// 200 once the supervisor has reported a tick and nothing is unhealthy
async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health.readiness().await;
    respond(readiness.ready, readiness)
}

fn encode_metrics() -> prometheus::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

async fn metrics() -> Response {
    match encode_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
