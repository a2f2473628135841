//! Raw measure purge
//!
//! Raw rows are only deleted once they are folded into aggregates. Definitions
//! with quartiles keep their rows for `max_days_to_update_quartile` days after
//! ingestion so late contributions can still be merged. Every aggregate whose
//! raw rows were deleted is stamped with `last_raw_measures_purged`, which
//! later blocks quartile recomputation for it.

use chrono::{DateTime, Duration, Utc};
use dacc_common::db::raw_measures::{self, PurgeFilter};
use dacc_common::db::{aggregations, begin_immediate, watermarks, MeasureDefinition};
use dacc_common::{time, Error, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::locks::MeasureLocks;

/// Outcome of a committed purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeReport {
    /// Raw rows deleted
    pub deleted: u64,
    /// Aggregates stamped with the purge date
    pub flagged: u64,
}

pub struct PurgeCoordinator {
    pool: SqlitePool,
    locks: MeasureLocks,
}

impl PurgeCoordinator {
    pub fn new(pool: SqlitePool, locks: MeasureLocks) -> Self {
        Self { pool, locks }
    }

    /// Delete the aggregated raw measures of `definition`
    ///
    /// Without `purge_date` everything up to the watermark is eligible. A
    /// `purge_date` after the watermark is refused with `PurgeSafetyViolation`
    /// while non-aggregated rows exist. A measure never aggregated is left
    /// untouched.
    pub async fn purge(
        &self,
        definition: &MeasureDefinition,
        purge_date: Option<DateTime<Utc>>,
    ) -> Result<PurgeReport> {
        let _guard = self.locks.acquire(&definition.name).await;
        let mut tx = begin_immediate(&self.pool).await?;

        let Some(watermark) = watermarks::get(&mut *tx, &definition.name).await? else {
            info!(measure = %definition.name, "No aggregation date, nothing to purge");
            return Ok(PurgeReport::default());
        };

        let purge_date = match purge_date {
            Some(date) if date > watermark => {
                let pending = raw_measures::count_after(&mut *tx, &definition.name, &watermark).await?;
                if pending > 0 {
                    return Err(Error::PurgeSafetyViolation {
                        measure: definition.name.clone(),
                        pending,
                    });
                }
                date
            }
            Some(date) => date,
            None => watermark,
        };

        let now = time::now();
        let filter = PurgeFilter {
            purge_date,
            retention_cutoff: retention_cutoff(definition, now)?,
        };

        let keys = raw_measures::purge_candidate_keys(&mut *tx, &definition.name, &filter).await?;
        let deleted = raw_measures::delete_for_purge(&mut *tx, &definition.name, &filter).await?;

        let mut flagged = 0;
        for key in &keys {
            let updated = aggregations::mark_raw_purged(&mut *tx, key, now).await?;
            if updated == 0 {
                warn!(key = %key, "Purged raw measures without aggregate");
            }
            flagged += updated;
        }

        tx.commit().await?;

        info!(
            measure = %definition.name,
            purge_date = %purge_date,
            deleted,
            flagged,
            "Raw measures purged"
        );
        Ok(PurgeReport { deleted, flagged })
    }
}

/// Rows of quartile definitions must be older than the retention window
///
/// `now > last_updated + max_days` is `last_updated < now - max_days`.
pub fn retention_cutoff(
    definition: &MeasureDefinition,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if !definition.with_quartiles {
        return Ok(None);
    }
    quartile_retention_start(definition.max_days_to_update_quartile, now).map(Some)
}

/// `now` minus `days`, refusing negative or unrepresentable retention windows
pub fn quartile_retention_start(days: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if days < 0 {
        return Err(Error::InvalidInput(format!(
            "maxDaysToUpdateQuartile of {} days cannot be negative",
            days
        )));
    }
    Duration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "maxDaysToUpdateQuartile of {} days is out of range",
                days
            ))
        })
}
