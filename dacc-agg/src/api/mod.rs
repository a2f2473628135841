//! HTTP API handlers for dacc-agg

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dacc_common::Error;
use serde_json::json;
use tracing::error;

pub mod health;
pub mod measures;
pub mod results;

pub use health::health_routes;
pub use measures::measure_routes;
pub use results::results_routes;

/// Error returned by API handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0 {
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            Error::Json(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Error::AccessDenied(msg) => (StatusCode::FORBIDDEN, msg),
            other => {
                error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
