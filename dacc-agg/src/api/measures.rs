//! Raw measure ingestion endpoint

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use dacc_common::db::IncomingMeasure;
use serde::Serialize;

use super::ApiError;
use crate::ingestion::insert_raw_measure;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureCreated {
    pub id: i64,
    pub measure_name: String,
}

/// POST /measure
///
/// 400 on validation errors, 404 when the measure has no definition.
pub async fn post_measure(
    State(state): State<AppState>,
    Json(measure): Json<IncomingMeasure>,
) -> Result<(StatusCode, Json<MeasureCreated>), ApiError> {
    let raw = insert_raw_measure(&state.db, &measure).await?;

    Ok((
        StatusCode::CREATED,
        Json(MeasureCreated {
            id: raw.id,
            measure_name: raw.key.measure_name,
        }),
    ))
}

pub fn measure_routes() -> Router<AppState> {
    Router::new().route("/measure", post(post_measure))
}
