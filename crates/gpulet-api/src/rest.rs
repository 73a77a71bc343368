//! REST API handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use gpulet_plugin::{ManagerHandle, ManagerStatus};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub manager: ManagerHandle,
}

/// Create the API router
pub fn create_router(manager: ManagerHandle) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/", get(version))
        .route("/health", get(health))
        .route("/restart", get(restart).post(restart))
        .route("/api/v1/resources", get(resources))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: "gpulet",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
}

/// Healthy once the first start pass has completed
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    if state.manager.is_ready() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "starting",
                ready: false,
            }),
        )
    }
}

async fn restart(State(state): State<Arc<AppState>>) -> StatusCode {
    info!("Restart requested over HTTP");
    state.manager.request_restart();
    StatusCode::ACCEPTED
}

async fn resources(State(state): State<Arc<AppState>>) -> Json<ManagerStatus> {
    Json(state.manager.status().await)
}
