//! Per-measure aggregation watermark
//!
//! The watermark is the ingestion timestamp up to which raw measures have been
//! folded into aggregates. Aggregation only moves it forward; the
//! administrative rollback is the single operation allowed to move it back.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::time::{from_micros, to_micros};
use crate::Result;

/// Last aggregated ingestion timestamp of a measure, `None` before the first run
pub async fn get(conn: &mut SqliteConnection, measure_name: &str) -> Result<Option<DateTime<Utc>>> {
    let date: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT d.last_aggregated_measure_date
        FROM aggregation_date AS d
        JOIN measure_definition AS m ON m.id = d.measure_definition_id
        WHERE m.name = ?
        "#,
    )
    .bind(measure_name)
    .fetch_optional(conn)
    .await?;

    date.map(from_micros).transpose()
}

/// Create or move the watermark of a definition
pub async fn set(
    conn: &mut SqliteConnection,
    measure_definition_id: i64,
    date: &DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO aggregation_date (measure_definition_id, last_aggregated_measure_date)
        VALUES (?, ?)
        ON CONFLICT(measure_definition_id) DO UPDATE SET
            last_aggregated_measure_date = excluded.last_aggregated_measure_date
        "#,
    )
    .bind(measure_definition_id)
    .bind(to_micros(date))
    .execute(conn)
    .await?;

    Ok(())
}
