//! Incremental aggregation engine
//!
//! A run folds the raw measures ingested since the measure's watermark into
//! the stored aggregates:
//!
//! 1. The window is `(watermark, end]` where `end` is the latest ingestion
//!    timestamp of the measure. No new row means nothing to do.
//! 2. Unless forced, the run is skipped until the execution frequency has
//!    elapsed since the watermark.
//! 3. Window rows are grouped by natural key and summarised.
//! 4. Each group is inserted, or merged into its existing aggregate. Quartiles
//!    are recomputed from raw data on merge (see [`crate::quantiles`]).
//! 5. Aggregate writes and the watermark move to `end` commit together.
//!
//! Every run holds the measure's lock and a single transaction: any error
//! drops the transaction and nothing is applied.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use dacc_common::db::{
    aggregations, begin_immediate, definitions, raw_measures, watermarks, Aggregation, GroupLabel,
    GroupSlot, MeasureDefinition, NaturalKey, PartialAggregate, RawMeasure,
};
use dacc_common::stats::{Quartiles, Summary};
use dacc_common::time::{self, to_micros, MIN_CURSOR};
use dacc_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::locks::MeasureLocks;
use crate::quantiles::{self, QuantileOutcome};
use crate::validate::is_execution_frequency_respected;

/// What happened to one natural-key group during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    Inserted,
    Merged,
    /// Raw data was purged so quartiles could not be recomputed; the group's
    /// window rows were archived and its aggregate left untouched
    RefusedPurged,
}

/// Result of a committed aggregation run
#[derive(Debug, Clone)]
pub struct AggregationRun {
    /// Inserted and merged aggregates, as persisted
    pub aggregates: Vec<Aggregation>,
    pub outcomes: Vec<(NaturalKey, GroupOutcome)>,
    /// New watermark
    pub watermark: DateTime<Utc>,
}

impl AggregationRun {
    pub fn count(&self, outcome: GroupOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }
}

/// Summary of an administrative rollback
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub deleted: u64,
    pub watermark: Option<DateTime<Utc>>,
}

/// Group raw rows by the natural key produced by `key_of`
///
/// Groups come out in natural-key order. Quartiles are only computed when
/// requested.
pub fn group_raw_measures<F>(rows: &[RawMeasure], with_quartiles: bool, key_of: F) -> Vec<PartialAggregate>
where
    F: Fn(&NaturalKey) -> NaturalKey,
{
    let mut groups: BTreeMap<NaturalKey, Vec<f64>> = BTreeMap::new();
    for row in rows {
        groups.entry(key_of(&row.key)).or_default().push(row.value);
    }

    groups
        .into_iter()
        .filter_map(|(key, values)| {
            let summary = Summary::from_values(&values)?;
            let quartiles = if with_quartiles {
                Quartiles::from_values(&values)
            } else {
                None
            };
            Some(PartialAggregate {
                key,
                summary,
                quartiles,
            })
        })
        .collect()
}

/// Runs aggregation, wildcard roll-ups and rollbacks against the store
#[derive(Clone)]
pub struct AggregationEngine {
    pool: SqlitePool,
    locks: MeasureLocks,
}

impl AggregationEngine {
    pub fn new(pool: SqlitePool, locks: MeasureLocks) -> Self {
        Self { pool, locks }
    }

    /// Fold new raw measures of `definition` into its aggregates
    ///
    /// Returns `None` when there is no new raw measure, or when the run is
    /// throttled by the execution frequency and `force` is not set.
    pub async fn aggregate(
        &self,
        definition: &MeasureDefinition,
        force: bool,
    ) -> Result<Option<AggregationRun>> {
        let _guard = self.locks.acquire(&definition.name).await;
        let started = std::time::Instant::now();
        let mut tx = begin_immediate(&self.pool).await?;

        let watermark = watermarks::get(&mut *tx, &definition.name).await?;
        let start = watermark.as_ref().map(to_micros).unwrap_or(MIN_CURSOR);

        let Some(end) = raw_measures::most_recent_ingestion(&mut *tx, &definition.name, start).await?
        else {
            info!(measure = %definition.name, "No new measure");
            return Ok(None);
        };

        let now = time::now();
        if !force && !is_execution_frequency_respected(definition, watermark.as_ref(), &now) {
            info!(
                measure = %definition.name,
                "Execution is too close from the last run"
            );
            return Ok(None);
        }

        let rows = raw_measures::fetch_window(&mut *tx, &definition.name, start, &end).await?;
        let partials = group_raw_measures(&rows, definition.with_quartiles, NaturalKey::clone);
        let keys: Vec<NaturalKey> = partials.iter().map(|p| p.key.clone()).collect();
        let existing = aggregations::find_by_keys(&mut *tx, &definition.name, &keys).await?;

        let mut to_insert = Vec::new();
        let mut to_update = Vec::new();
        let mut outcomes = Vec::with_capacity(partials.len());

        for partial in partials {
            let Some(current) = existing.get(&partial.key) else {
                debug!(key = %partial.key, count = partial.summary.count, "New aggregate");
                outcomes.push((partial.key.clone(), GroupOutcome::Inserted));
                to_insert.push(Aggregation::from_partial(definition, partial, now));
                continue;
            };

            let mut merged = current.merge(&partial, now)?;
            if definition.with_quartiles {
                match quantiles::recompute(&mut *tx, current, &end).await? {
                    QuantileOutcome::Recomputed(quartiles) => merged.quartiles = Some(quartiles),
                    QuantileOutcome::RawDataPurged => {
                        quantiles::refuse(&mut *tx, &partial.key, start, &end, now).await?;
                        outcomes.push((partial.key, GroupOutcome::RefusedPurged));
                        continue;
                    }
                }
            }

            debug!(
                key = %partial.key,
                count = merged.summary.count,
                "Merged into existing aggregate"
            );
            outcomes.push((partial.key, GroupOutcome::Merged));
            to_update.push(merged);
        }

        for aggregation in &mut to_insert {
            aggregation.id = Some(aggregations::insert(&mut *tx, aggregation).await?);
        }
        for aggregation in &to_update {
            let id = aggregation.id.ok_or_else(|| {
                Error::Internal(format!("Stored aggregate without id: {}", aggregation.key))
            })?;
            aggregations::update(&mut *tx, id, aggregation, definition.with_quartiles).await?;
        }

        watermarks::set(&mut *tx, definition.id, &end).await?;
        tx.commit().await?;

        let run = AggregationRun {
            aggregates: to_insert.into_iter().chain(to_update).collect(),
            outcomes,
            watermark: end,
        };
        info!(
            measure = %definition.name,
            raw = rows.len(),
            inserted = run.count(GroupOutcome::Inserted),
            merged = run.count(GroupOutcome::Merged),
            refused = run.count(GroupOutcome::RefusedPurged),
            watermark = %end,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation committed"
        );
        Ok(Some(run))
    }

    /// Run [`aggregate`](Self::aggregate) for every definition
    ///
    /// A failing definition is logged and skipped; its transaction was rolled
    /// back and the next scheduled pass retries it.
    pub async fn aggregate_all(&self, force: bool) -> Result<Vec<(String, AggregationRun)>> {
        let all = {
            let mut conn = self.pool.acquire().await?;
            definitions::list_all(&mut conn).await?
        };

        let mut runs = Vec::new();
        for definition in all {
            match self.aggregate(&definition, force).await {
                Ok(Some(run)) => runs.push((definition.name, run)),
                Ok(None) => {}
                Err(e) => error!(measure = %definition.name, "Error while aggregating: {}", e),
            }
        }
        Ok(runs)
    }

    /// Replace the roll-ups where `wildcard_groups` are collapsed to `*`
    ///
    /// Raw rows ingested in `(from, to]` are grouped with the wildcarded slots
    /// replaced by `{key: "*"}`. Any aggregate already stored at a resulting
    /// natural key is deleted and the new one inserted in its place.
    pub async fn compute_wildcard_aggregate(
        &self,
        definition: &MeasureDefinition,
        wildcard_groups: &[GroupSlot],
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Vec<Aggregation>> {
        let wildcards = wildcard_labels(definition, wildcard_groups)?;

        let _guard = self.locks.acquire(&definition.name).await;
        let mut tx = begin_immediate(&self.pool).await?;

        let rows = raw_measures::fetch_window(&mut *tx, &definition.name, to_micros(from), to).await?;
        let partials = group_raw_measures(&rows, definition.with_quartiles, |key| {
            let mut key = key.clone();
            for (slot, label) in &wildcards {
                *key.group_mut(*slot) = Some(label.clone());
            }
            key
        });

        let now = time::now();
        let mut inserted = Vec::with_capacity(partials.len());
        for partial in partials {
            let replaced = aggregations::delete_by_key(&mut *tx, &partial.key).await?;
            if replaced > 0 {
                debug!(key = %partial.key, "Replacing wildcard aggregate");
            }
            let mut aggregation = Aggregation::from_partial(definition, partial, now);
            aggregation.id = Some(aggregations::insert(&mut *tx, &aggregation).await?);
            inserted.push(aggregation);
        }

        tx.commit().await?;

        info!(
            measure = %definition.name,
            groups = ?wildcard_groups,
            aggregates = inserted.len(),
            "Wildcard aggregates computed"
        );
        Ok(inserted)
    }

    /// Delete aggregates whose bucket starts at or after `from` and move the
    /// watermark back so the next run rebuilds them
    ///
    /// The watermark goes to just before the earliest already-aggregated
    /// ingestion of those buckets. Refused when a deleted aggregate lost its
    /// raw data to a purge, or when an older bucket has rows in the rolled-back
    /// interval, since they would be merged a second time.
    pub async fn rollback_aggregates(
        &self,
        definition: &MeasureDefinition,
        from: &DateTime<Utc>,
    ) -> Result<RollbackReport> {
        let _guard = self.locks.acquire(&definition.name).await;
        let mut tx = begin_immediate(&self.pool).await?;

        let purged = aggregations::count_purged_from(&mut *tx, &definition.name, from).await?;
        if purged > 0 {
            return Err(Error::RollbackConflict(format!(
                "{} aggregates of {} from {} have purged raw measures",
                purged, definition.name, from
            )));
        }

        let watermark = watermarks::get(&mut *tx, &definition.name).await?;
        let mut new_watermark = watermark;
        if let Some(current) = watermark {
            let earliest =
                raw_measures::earliest_ingestion_from(&mut *tx, &definition.name, from, &current)
                    .await?;
            if let Some(earliest) = earliest {
                let rolled_back = earliest - Duration::microseconds(1);
                let older = raw_measures::count_older_buckets_in_window(
                    &mut *tx,
                    &definition.name,
                    from,
                    &rolled_back,
                    &current,
                )
                .await?;
                if older > 0 {
                    return Err(Error::RollbackConflict(format!(
                        "{} raw measures of {} before {} would be aggregated twice",
                        older, definition.name, from
                    )));
                }
                watermarks::set(&mut *tx, definition.id, &rolled_back).await?;
                new_watermark = Some(rolled_back);
            }
        }

        let deleted = aggregations::delete_from(&mut *tx, &definition.name, from).await?;
        tx.commit().await?;

        if deleted == 0 {
            warn!(measure = %definition.name, from = %from, "No aggregate to roll back");
        } else {
            info!(
                measure = %definition.name,
                from = %from,
                deleted,
                watermark = ?new_watermark,
                "Aggregates rolled back"
            );
        }
        Ok(RollbackReport {
            deleted,
            watermark: new_watermark,
        })
    }
}

/// Wildcard label per slot, checked against the definition
fn wildcard_labels(
    definition: &MeasureDefinition,
    wildcard_groups: &[GroupSlot],
) -> Result<Vec<(GroupSlot, GroupLabel)>> {
    let distinct: BTreeSet<&str> = wildcard_groups.iter().map(GroupSlot::as_str).collect();
    if wildcard_groups.is_empty() || wildcard_groups.len() > 2 || distinct.len() != wildcard_groups.len() {
        return Err(Error::InvalidInput(
            "One or two distinct groups must be wildcarded".to_string(),
        ));
    }

    wildcard_groups
        .iter()
        .map(|slot| {
            definition
                .group_key(*slot)
                .map(|key| (*slot, GroupLabel::wildcard(key)))
                .ok_or_else(|| {
                    Error::InvalidInput(format!("{} has no {} key", definition.name, slot))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: i64, created_by: &str, day: u32, slug: &str, value: f64) -> RawMeasure {
        RawMeasure {
            id,
            key: NaturalKey {
                measure_name: "konnector-trigger".to_string(),
                start_date: Utc.with_ymd_and_hms(2022, 1, day, 0, 0, 0).unwrap(),
                created_by: Some(created_by.to_string()),
                group1: Some(GroupLabel::new("slug", slug)),
                group2: None,
                group3: None,
            },
            value,
            last_updated: Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, id as u32).unwrap(),
            aggregation_period: None,
        }
    }

    #[test]
    fn test_group_by_natural_key() {
        let rows = vec![
            row(1, "app-a", 1, "x", 5.0),
            row(2, "app-a", 1, "x", 10.0),
            row(3, "app-b", 1, "x", 3.0),
            row(4, "app-a", 2, "x", 0.0),
        ];

        let groups = group_raw_measures(&rows, false, NaturalKey::clone);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].summary.count, 2);
        assert_eq!(groups[0].summary.sum, 15.0);
        assert!(groups[0].quartiles.is_none());
        assert_eq!(groups[2].summary.count_not_zero, 0);
    }

    #[test]
    fn test_group_with_wildcard_key() {
        let rows = vec![
            row(1, "app-a", 1, "x", 20.0),
            row(2, "app-a", 1, "y", 40.0),
            row(3, "app-a", 1, "z", 60.0),
        ];

        let groups = group_raw_measures(&rows, true, |key| {
            let mut key = key.clone();
            key.group1 = Some(GroupLabel::wildcard("slug"));
            key
        });

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key.group1, Some(GroupLabel::new("slug", "*")));
        assert_eq!(groups[0].summary.count, 3);
        assert_eq!(groups[0].quartiles.map(|q| q.median), Some(40.0));
    }

    #[test]
    fn test_wildcard_labels_validation() {
        let mut definition = MeasureDefinition::new("konnector-trigger");
        definition.group1_key = Some("slug".to_string());
        definition.group2_key = Some("trigger".to_string());

        let labels = wildcard_labels(&definition, &[GroupSlot::Group1, GroupSlot::Group2]).unwrap();
        assert_eq!(labels[1], (GroupSlot::Group2, GroupLabel::new("trigger", "*")));

        assert!(wildcard_labels(&definition, &[]).is_err());
        assert!(wildcard_labels(&definition, &[GroupSlot::Group3]).is_err());
        assert!(wildcard_labels(&definition, &[GroupSlot::Group1, GroupSlot::Group1]).is_err());
        assert!(wildcard_labels(
            &definition,
            &[GroupSlot::Group1, GroupSlot::Group2, GroupSlot::Group3]
        )
        .is_err());
    }
}
