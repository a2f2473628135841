//! Health check endpoint

use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Returns status, module name and version
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "dacc-agg".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness route, answered without touching the database
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
