//! Quartile recomputation for merged aggregates
//!
//! Median and quartiles cannot be combined from partial results. When an
//! existing aggregate receives new contributions, they are recomputed from
//! every raw row of its natural key. Once a purge has removed some of those
//! rows the recomputation is impossible and the new contributions are
//! archived instead of merged.

use chrono::{DateTime, Utc};
use dacc_common::db::{raw_measures, Aggregation, NaturalKey};
use dacc_common::stats::Quartiles;
use dacc_common::{Error, Result};
use sqlx::SqliteConnection;
use tracing::error;

/// Result of a quartile recomputation attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantileOutcome {
    Recomputed(Quartiles),
    /// Raw rows of the aggregate were purged before this merge
    RawDataPurged,
}

/// Recompute the quartiles of `existing` from all raw rows ingested up to `until`
///
/// Fails with `QuantileRecomputationFailed` when no raw row is found: the
/// grouped window just saw rows for this key, so an empty requery means the
/// store is inconsistent.
pub async fn recompute(
    conn: &mut SqliteConnection,
    existing: &Aggregation,
    until: &DateTime<Utc>,
) -> Result<QuantileOutcome> {
    if existing.last_raw_measures_purged.is_some() {
        return Ok(QuantileOutcome::RawDataPurged);
    }

    let values = raw_measures::values_for_key(conn, &existing.key, until).await?;
    Quartiles::from_values(&values)
        .map(QuantileOutcome::Recomputed)
        .ok_or_else(|| Error::QuantileRecomputationFailed {
            measure: existing.key.measure_name.clone(),
            start_date: existing.key.start_date.to_rfc3339(),
        })
}

/// Archive the contributions of a refused merge
///
/// Copies the rows of `key` ingested in `(after, until]` to the refused
/// archive and returns how many were copied.
pub async fn refuse(
    conn: &mut SqliteConnection,
    key: &NaturalKey,
    after: i64,
    until: &DateTime<Utc>,
    rejected_at: DateTime<Utc>,
) -> Result<u64> {
    let archived = raw_measures::archive_refused(conn, key, after, until, rejected_at).await?;

    error!(
        measure = %key.measure_name,
        start_date = %key.start_date,
        archived,
        "Prevent aggregate quartiles on purged measures"
    );
    Ok(archived)
}
