//! Aggregation store queries

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::keys::{push_key_filter, KeyRow};
use crate::db::models::{group_to_column, Aggregation, NaturalKey};
use crate::stats::{Quartiles, Summary};
use crate::time::{from_micros, to_micros};
use crate::Result;

#[derive(sqlx::FromRow)]
struct AggregationRow {
    id: i64,
    sum: f64,
    count: i64,
    count_not_zero: i64,
    min: f64,
    max: f64,
    avg: f64,
    std: f64,
    median: Option<f64>,
    first_quartile: Option<f64>,
    third_quartile: Option<f64>,
    last_updated: i64,
    last_raw_measures_purged: Option<i64>,
    #[sqlx(flatten)]
    key: KeyRow,
}

impl TryFrom<AggregationRow> for Aggregation {
    type Error = crate::Error;

    fn try_from(row: AggregationRow) -> Result<Self> {
        let quartiles = match (row.median, row.first_quartile, row.third_quartile) {
            (Some(median), Some(first_quartile), Some(third_quartile)) => Some(Quartiles {
                median,
                first_quartile,
                third_quartile,
            }),
            _ => None,
        };

        Ok(Aggregation {
            id: Some(row.id),
            key: row.key.try_into()?,
            summary: Summary {
                count: row.count,
                count_not_zero: row.count_not_zero,
                sum: row.sum,
                min: row.min,
                max: row.max,
                avg: row.avg,
                std: row.std,
            },
            quartiles,
            last_updated: from_micros(row.last_updated)?,
            last_raw_measures_purged: row.last_raw_measures_purged.map(from_micros).transpose()?,
        })
    }
}

const AGGREGATION_COLUMNS: &str = "id, measure_name, start_date, created_by, group1, group2, group3, \
     sum, count, count_not_zero, min, max, avg, std, \
     median, first_quartile, third_quartile, last_updated, last_raw_measures_purged";

/// Existing aggregates for a set of natural keys of one measure, indexed by key
///
/// Candidates are narrowed by measure and start date in SQL, then matched on
/// the full key.
pub async fn find_by_keys(
    conn: &mut SqliteConnection,
    measure_name: &str,
    keys: &[NaturalKey],
) -> Result<HashMap<NaturalKey, Aggregation>> {
    let dates: BTreeSet<i64> = keys.iter().map(|k| to_micros(&k.start_date)).collect();
    if dates.is_empty() {
        return Ok(HashMap::new());
    }

    let wanted: HashSet<&NaturalKey> = keys.iter().collect();
    let mut found = HashMap::new();

    // Stay well below SQLite's bound-parameter limit
    let dates: Vec<i64> = dates.into_iter().collect();
    for chunk in dates.chunks(500) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM aggregation WHERE measure_name = ",
            AGGREGATION_COLUMNS
        ));
        qb.push_bind(measure_name.to_string());
        qb.push(" AND start_date IN (");
        let mut separated = qb.separated(", ");
        for date in chunk {
            separated.push_bind(*date);
        }
        separated.push_unseparated(")");

        let rows = qb
            .build_query_as::<AggregationRow>()
            .fetch_all(&mut *conn)
            .await?;

        for row in rows {
            let aggregation = Aggregation::try_from(row)?;
            if wanted.contains(&aggregation.key) {
                found.insert(aggregation.key.clone(), aggregation);
            }
        }
    }

    Ok(found)
}

/// The aggregate stored for one natural key
pub async fn find_by_key(conn: &mut SqliteConnection, key: &NaturalKey) -> Result<Option<Aggregation>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM aggregation WHERE",
        AGGREGATION_COLUMNS
    ));
    push_key_filter(&mut qb, key);

    let row = qb
        .build_query_as::<AggregationRow>()
        .fetch_optional(conn)
        .await?;

    row.map(Aggregation::try_from).transpose()
}

/// All aggregates of a measure, ordered by start date
pub async fn list_by_name(conn: &mut SqliteConnection, measure_name: &str) -> Result<Vec<Aggregation>> {
    let rows = sqlx::query_as::<_, AggregationRow>(&format!(
        "SELECT {} FROM aggregation WHERE measure_name = ? ORDER BY start_date, id",
        AGGREGATION_COLUMNS
    ))
    .bind(measure_name)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(Aggregation::try_from).collect()
}

/// Insert a new aggregate, returning its id
pub async fn insert(conn: &mut SqliteConnection, aggregation: &Aggregation) -> Result<i64> {
    let key = &aggregation.key;
    let summary = &aggregation.summary;
    let quartiles = aggregation.quartiles.as_ref();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO aggregation (
            measure_name, start_date, created_by, group1, group2, group3,
            sum, count, count_not_zero, min, max, avg, std,
            median, first_quartile, third_quartile,
            last_updated, last_raw_measures_purged
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&key.measure_name)
    .bind(to_micros(&key.start_date))
    .bind(&key.created_by)
    .bind(group_to_column(&key.group1))
    .bind(group_to_column(&key.group2))
    .bind(group_to_column(&key.group3))
    .bind(summary.sum)
    .bind(summary.count)
    .bind(summary.count_not_zero)
    .bind(summary.min)
    .bind(summary.max)
    .bind(summary.avg)
    .bind(summary.std)
    .bind(quartiles.map(|q| q.median))
    .bind(quartiles.map(|q| q.first_quartile))
    .bind(quartiles.map(|q| q.third_quartile))
    .bind(to_micros(&aggregation.last_updated))
    .bind(aggregation.last_raw_measures_purged.as_ref().map(to_micros))
    .fetch_one(conn)
    .await?;

    Ok(id)
}

/// Overwrite the statistics of a stored aggregate
///
/// Quartile columns are only written when `with_quartiles` is set, so a
/// definition without quartiles never clears values computed earlier.
pub async fn update(
    conn: &mut SqliteConnection,
    id: i64,
    aggregation: &Aggregation,
    with_quartiles: bool,
) -> Result<()> {
    let summary = &aggregation.summary;
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE aggregation SET sum = ");
    qb.push_bind(summary.sum)
        .push(", count = ")
        .push_bind(summary.count)
        .push(", count_not_zero = ")
        .push_bind(summary.count_not_zero)
        .push(", min = ")
        .push_bind(summary.min)
        .push(", max = ")
        .push_bind(summary.max)
        .push(", avg = ")
        .push_bind(summary.avg)
        .push(", std = ")
        .push_bind(summary.std)
        .push(", last_updated = ")
        .push_bind(to_micros(&aggregation.last_updated));

    if with_quartiles {
        let quartiles = aggregation.quartiles.as_ref();
        qb.push(", median = ")
            .push_bind(quartiles.map(|q| q.median))
            .push(", first_quartile = ")
            .push_bind(quartiles.map(|q| q.first_quartile))
            .push(", third_quartile = ")
            .push_bind(quartiles.map(|q| q.third_quartile));
    }

    qb.push(" WHERE id = ").push_bind(id);
    qb.build().execute(conn).await?;

    Ok(())
}

/// Flag the aggregate of a natural key as having lost its raw rows
pub async fn mark_raw_purged(
    conn: &mut SqliteConnection,
    key: &NaturalKey,
    purged_at: DateTime<Utc>,
) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE aggregation SET last_raw_measures_purged = ");
    qb.push_bind(to_micros(&purged_at));
    qb.push(" WHERE");
    push_key_filter(&mut qb, key);

    let result = qb.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// Delete the aggregate of one natural key
pub async fn delete_by_key(conn: &mut SqliteConnection, key: &NaturalKey) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM aggregation WHERE");
    push_key_filter(&mut qb, key);

    let result = qb.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// Delete every aggregate of a measure whose time bucket starts at or after
/// `from_start_date`
pub async fn delete_from(
    conn: &mut SqliteConnection,
    measure_name: &str,
    from_start_date: &DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM aggregation WHERE measure_name = ? AND start_date >= ?")
        .bind(measure_name)
        .bind(to_micros(from_start_date))
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Aggregates from `from_start_date` onwards already flagged as purged
pub async fn count_purged_from(
    conn: &mut SqliteConnection,
    measure_name: &str,
    from_start_date: &DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM aggregation \
         WHERE measure_name = ? AND start_date >= ? AND last_raw_measures_purged IS NOT NULL",
    )
    .bind(measure_name)
    .bind(to_micros(from_start_date))
    .fetch_one(conn)
    .await?;

    Ok(count)
}

/// Aggregates of a measure in `[start_date, end_date)` whose contribution
/// count clears the definition's threshold
pub async fn query_range_with_threshold(
    conn: &mut SqliteConnection,
    measure_name: &str,
    start_date: &DateTime<Utc>,
    end_date: &DateTime<Utc>,
    created_by: Option<&str>,
) -> Result<Vec<Aggregation>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM filtered_aggregation WHERE measure_name = ",
        AGGREGATION_COLUMNS
    ));
    qb.push_bind(measure_name.to_string())
        .push(" AND start_date >= ")
        .push_bind(to_micros(start_date))
        .push(" AND start_date < ")
        .push_bind(to_micros(end_date));
    if let Some(created_by) = created_by {
        qb.push(" AND created_by = ").push_bind(created_by.to_string());
    }
    qb.push(" ORDER BY start_date, id");

    let rows = qb.build_query_as::<AggregationRow>().fetch_all(conn).await?;
    rows.into_iter().map(Aggregation::try_from).collect()
}
