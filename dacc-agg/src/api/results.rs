//! Aggregate restitution endpoint

use axum::{extract::State, routing::post, Json, Router};

use super::ApiError;
use crate::restitution::{query_results, AggregateResult};
use crate::validate::ResultsQuery;
use crate::AppState;

/// POST /aggregate
///
/// Threshold-filtered aggregates for `{measureName, createdBy?, startDate,
/// endDate}`. 403 when the measure is not open to applications.
pub async fn post_aggregate(
    State(state): State<AppState>,
    Json(query): Json<ResultsQuery>,
) -> Result<Json<Vec<AggregateResult>>, ApiError> {
    let results = query_results(&state.db, &query).await?;
    Ok(Json(results))
}

pub fn results_routes() -> Router<AppState> {
    Router::new().route("/aggregate", post(post_aggregate))
}
