//! Threshold-filtered aggregate restitution
//!
//! Only aggregates with at least `aggregation_threshold` contributions ever
//! leave the service.

use chrono::{DateTime, Utc};
use dacc_common::db::{aggregations, definitions, Aggregation, GroupLabel};
use dacc_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::validate::{validate_results_query, ResultsQuery};

/// One aggregate as exposed to readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub measure_name: String,
    pub start_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group1: Option<GroupLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group2: Option<GroupLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group3: Option<GroupLabel>,
    pub sum: f64,
    pub count: i64,
    pub count_not_zero: i64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub std: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_quartile: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub third_quartile: Option<f64>,
}

impl From<Aggregation> for AggregateResult {
    fn from(aggregation: Aggregation) -> Self {
        let Aggregation {
            key,
            summary,
            quartiles,
            ..
        } = aggregation;

        Self {
            measure_name: key.measure_name,
            start_date: key.start_date,
            created_by: key.created_by,
            group1: key.group1,
            group2: key.group2,
            group3: key.group3,
            sum: summary.sum,
            count: summary.count,
            count_not_zero: summary.count_not_zero,
            min: summary.min,
            max: summary.max,
            avg: summary.avg,
            std: summary.std,
            median: quartiles.map(|q| q.median),
            first_quartile: quartiles.map(|q| q.first_quartile),
            third_quartile: quartiles.map(|q| q.third_quartile),
        }
    }
}

/// Aggregates of `measure_name` with a bucket in `[start_date, end_date)`
/// that clear the definition's threshold, ordered by bucket
pub async fn get_results(
    pool: &SqlitePool,
    measure_name: &str,
    created_by: Option<&str>,
    start_date: &DateTime<Utc>,
    end_date: &DateTime<Utc>,
) -> Result<Vec<AggregateResult>> {
    let mut conn = pool.acquire().await?;
    let aggregates = aggregations::query_range_with_threshold(
        &mut conn,
        measure_name,
        start_date,
        end_date,
        created_by,
    )
    .await?;

    debug!(measure = %measure_name, results = aggregates.len(), "Aggregates restituted");
    Ok(aggregates.into_iter().map(AggregateResult::from).collect())
}

/// Validate a client query, then restitute its aggregates
pub async fn query_results(pool: &SqlitePool, query: &ResultsQuery) -> Result<Vec<AggregateResult>> {
    let definition = {
        let mut conn = pool.acquire().await?;
        definitions::find_by_name(&mut conn, &query.measure_name)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("No measure definition found for: {}", query.measure_name))
            })?
    };
    let window = validate_results_query(&definition, query)?;

    get_results(
        pool,
        &definition.name,
        window.created_by.as_deref(),
        &window.start_date,
        &window.end_date,
    )
    .await
}
