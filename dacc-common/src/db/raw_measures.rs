//! Raw measure store queries
//!
//! Raw rows are only ever inserted, read, archived and deleted; they are never
//! updated in place.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::keys::{push_key_filter, KeyRow};
use crate::db::models::{group_to_column, NaturalKey, RawMeasure, RefusedRawMeasure};
use crate::time::{from_micros, to_micros};
use crate::Result;

#[derive(sqlx::FromRow)]
struct RawMeasureRow {
    id: i64,
    value: f64,
    last_updated: i64,
    aggregation_period: Option<String>,
    #[sqlx(flatten)]
    key: KeyRow,
}

impl TryFrom<RawMeasureRow> for RawMeasure {
    type Error = crate::Error;

    fn try_from(row: RawMeasureRow) -> Result<Self> {
        Ok(RawMeasure {
            id: row.id,
            key: row.key.try_into()?,
            value: row.value,
            last_updated: from_micros(row.last_updated)?,
            aggregation_period: row.aggregation_period,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefusedRow {
    id: i64,
    value: f64,
    last_updated: i64,
    aggregation_period: Option<String>,
    rejected_date: i64,
    #[sqlx(flatten)]
    key: KeyRow,
}

impl TryFrom<RefusedRow> for RefusedRawMeasure {
    type Error = crate::Error;

    fn try_from(row: RefusedRow) -> Result<Self> {
        Ok(RefusedRawMeasure {
            id: row.id,
            key: row.key.try_into()?,
            value: row.value,
            last_updated: from_micros(row.last_updated)?,
            aggregation_period: row.aggregation_period,
            rejected_date: from_micros(row.rejected_date)?,
        })
    }
}

const RAW_COLUMNS: &str = "id, measure_name, value, start_date, last_updated, \
                           aggregation_period, created_by, group1, group2, group3";

/// Which raw rows a purge may delete
#[derive(Debug, Clone, Copy)]
pub struct PurgeFilter {
    /// Rows ingested at or before this instant
    pub purge_date: DateTime<Utc>,
    /// Rows must also be ingested strictly before this instant when set
    pub retention_cutoff: Option<DateTime<Utc>>,
}

fn push_purge_filter(qb: &mut QueryBuilder<'_, Sqlite>, measure_name: &str, filter: &PurgeFilter) {
    qb.push(" WHERE measure_name = ")
        .push_bind(measure_name.to_string())
        .push(" AND last_updated <= ")
        .push_bind(to_micros(&filter.purge_date));
    if let Some(cutoff) = filter.retention_cutoff {
        qb.push(" AND last_updated < ").push_bind(to_micros(&cutoff));
    }
}

/// Append one observation
///
/// The ingestion timestamp is assigned by the statement itself: `now`, or one
/// microsecond after the latest ingestion timestamp or watermark in the store,
/// whichever is later. Timestamps are therefore strictly increasing even when
/// the wall clock stalls or steps back.
pub async fn insert(
    conn: &mut SqliteConnection,
    key: &NaturalKey,
    value: f64,
    aggregation_period: Option<&str>,
    now: DateTime<Utc>,
) -> Result<RawMeasure> {
    let (id, last_updated): (i64, i64) = sqlx::query_as(
        r#"
        INSERT INTO raw_measure (
            measure_name, value, start_date, last_updated,
            aggregation_period, created_by, group1, group2, group3
        )
        VALUES (
            ?, ?, ?,
            MAX(
                ?,
                IFNULL((SELECT MAX(last_updated) FROM raw_measure) + 1, 0),
                IFNULL((SELECT MAX(last_aggregated_measure_date) FROM aggregation_date) + 1, 0)
            ),
            ?, ?, ?, ?, ?
        )
        RETURNING id, last_updated
        "#,
    )
    .bind(&key.measure_name)
    .bind(value)
    .bind(to_micros(&key.start_date))
    .bind(to_micros(&now))
    .bind(aggregation_period)
    .bind(&key.created_by)
    .bind(group_to_column(&key.group1))
    .bind(group_to_column(&key.group2))
    .bind(group_to_column(&key.group3))
    .fetch_one(conn)
    .await?;

    Ok(RawMeasure {
        id,
        key: key.clone(),
        value,
        last_updated: from_micros(last_updated)?,
        aggregation_period: aggregation_period.map(str::to_string),
    })
}

/// Most recent ingestion timestamp for a measure strictly after `after`
pub async fn most_recent_ingestion(
    conn: &mut SqliteConnection,
    measure_name: &str,
    after: i64,
) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(last_updated) FROM raw_measure WHERE measure_name = ? AND last_updated > ?",
    )
    .bind(measure_name)
    .bind(after)
    .fetch_one(conn)
    .await?;

    latest.map(from_micros).transpose()
}

/// Raw rows ingested in `(after, until]`
pub async fn fetch_window(
    conn: &mut SqliteConnection,
    measure_name: &str,
    after: i64,
    until: &DateTime<Utc>,
) -> Result<Vec<RawMeasure>> {
    let rows = sqlx::query_as::<_, RawMeasureRow>(&format!(
        "SELECT {} FROM raw_measure \
         WHERE measure_name = ? AND last_updated > ? AND last_updated <= ? \
         ORDER BY last_updated",
        RAW_COLUMNS
    ))
    .bind(measure_name)
    .bind(after)
    .bind(to_micros(until))
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(RawMeasure::try_from).collect()
}

/// Values of every raw row of one natural key ingested up to `until`
pub async fn values_for_key(
    conn: &mut SqliteConnection,
    key: &NaturalKey,
    until: &DateTime<Utc>,
) -> Result<Vec<f64>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT value FROM raw_measure WHERE");
    push_key_filter(&mut qb, key);
    qb.push(" AND last_updated <= ").push_bind(to_micros(until));

    let values = qb.build_query_scalar::<f64>().fetch_all(conn).await?;
    Ok(values)
}

/// All raw rows of a measure, in ingestion order
pub async fn list_by_name(conn: &mut SqliteConnection, measure_name: &str) -> Result<Vec<RawMeasure>> {
    let rows = sqlx::query_as::<_, RawMeasureRow>(&format!(
        "SELECT {} FROM raw_measure WHERE measure_name = ? ORDER BY last_updated",
        RAW_COLUMNS
    ))
    .bind(measure_name)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(RawMeasure::try_from).collect()
}

/// Number of raw rows of a measure ingested strictly after `after`
pub async fn count_after(
    conn: &mut SqliteConnection,
    measure_name: &str,
    after: &DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM raw_measure WHERE measure_name = ? AND last_updated > ?",
    )
    .bind(measure_name)
    .bind(to_micros(after))
    .fetch_one(conn)
    .await?;

    Ok(count)
}

/// Distinct natural keys of the rows a purge would delete
pub async fn purge_candidate_keys(
    conn: &mut SqliteConnection,
    measure_name: &str,
    filter: &PurgeFilter,
) -> Result<Vec<NaturalKey>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT DISTINCT measure_name, start_date, created_by, group1, group2, group3 \
         FROM raw_measure",
    );
    push_purge_filter(&mut qb, measure_name, filter);

    let rows = qb.build_query_as::<KeyRow>().fetch_all(conn).await?;
    rows.into_iter().map(NaturalKey::try_from).collect()
}

/// Delete the rows matched by a purge filter
pub async fn delete_for_purge(
    conn: &mut SqliteConnection,
    measure_name: &str,
    filter: &PurgeFilter,
) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM raw_measure");
    push_purge_filter(&mut qb, measure_name, filter);

    let result = qb.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// Copy the rows of one natural key ingested in `(after, until]` to the
/// refused archive
pub async fn archive_refused(
    conn: &mut SqliteConnection,
    key: &NaturalKey,
    after: i64,
    until: &DateTime<Utc>,
    rejected_at: DateTime<Utc>,
) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "INSERT INTO refused_raw_measure (\
            measure_name, value, start_date, last_updated, aggregation_period, \
            created_by, group1, group2, group3, rejected_date) \
         SELECT measure_name, value, start_date, last_updated, aggregation_period, \
            created_by, group1, group2, group3, ",
    );
    qb.push_bind(to_micros(&rejected_at));
    qb.push(" FROM raw_measure WHERE");
    push_key_filter(&mut qb, key);
    qb.push(" AND last_updated > ")
        .push_bind(after)
        .push(" AND last_updated <= ")
        .push_bind(to_micros(until));

    let result = qb.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// Archived refused rows of a measure
pub async fn list_refused(
    conn: &mut SqliteConnection,
    measure_name: &str,
) -> Result<Vec<RefusedRawMeasure>> {
    let rows = sqlx::query_as::<_, RefusedRow>(
        "SELECT id, measure_name, value, start_date, last_updated, aggregation_period, \
                created_by, group1, group2, group3, rejected_date \
         FROM refused_raw_measure WHERE measure_name = ? ORDER BY id",
    )
    .bind(measure_name)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(RefusedRawMeasure::try_from).collect()
}

/// Earliest ingestion timestamp, up to `until`, among rows whose time bucket
/// starts at or after `from_start_date`
pub async fn earliest_ingestion_from(
    conn: &mut SqliteConnection,
    measure_name: &str,
    from_start_date: &DateTime<Utc>,
    until: &DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let earliest: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(last_updated) FROM raw_measure \
         WHERE measure_name = ? AND start_date >= ? AND last_updated <= ?",
    )
    .bind(measure_name)
    .bind(to_micros(from_start_date))
    .bind(to_micros(until))
    .fetch_one(conn)
    .await?;

    earliest.map(from_micros).transpose()
}

/// Rows of buckets before `before_start_date` ingested in `(after, until]`
pub async fn count_older_buckets_in_window(
    conn: &mut SqliteConnection,
    measure_name: &str,
    before_start_date: &DateTime<Utc>,
    after: &DateTime<Utc>,
    until: &DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM raw_measure \
         WHERE measure_name = ? AND start_date < ? AND last_updated > ? AND last_updated <= ?",
    )
    .bind(measure_name)
    .bind(to_micros(before_start_date))
    .bind(to_micros(after))
    .bind(to_micros(until))
    .fetch_one(conn)
    .await?;

    Ok(count)
}
