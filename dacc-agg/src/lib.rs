//! dacc-agg library - measure aggregation service
//!
//! Incremental aggregation, quartile recomputation, purge and threshold
//! restitution over the dacc store, plus the HTTP surface of the service.

use axum::Router;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

pub mod aggregation;
pub mod api;
pub mod ingestion;
pub mod locks;
pub mod purge;
pub mod quantiles;
pub mod restitution;
pub mod scheduler;
pub mod validate;

pub use aggregation::{AggregationEngine, AggregationRun, GroupOutcome, RollbackReport};
pub use locks::MeasureLocks;
pub use purge::{PurgeCoordinator, PurgeReport};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
}

impl AppState {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::measure_routes())
        .merge(api::results_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
