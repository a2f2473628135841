//! Database schema migrations
//!
//! Versioned, idempotent schema upgrades applied on top of the base tables
//! created in `init`. The applied version is tracked in `schema_version`.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - databases in the field already ran them
//! 2. **Always add new migrations** - one function per schema change
//! 3. **Check before altering** - every step must be safe to run twice

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    if current_version < 3 {
        migrate_v3(pool).await?;
        set_schema_version(pool, 3).await?;
        info!("✓ Migration v3 completed");
    }

    if current_version < 4 {
        migrate_v4(pool).await?;
        set_schema_version(pool, 4).await?;
        info!("✓ Migration v4 completed");
    }

    info!("All migrations completed successfully");
    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if has_column(pool, table, column).await? {
        return Ok(());
    }
    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))
        .execute(pool)
        .await?;
    info!("Added column {}.{}", table, column);
    Ok(())
}

/// Migration v1: quartile columns on aggregates and the per-definition switch
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    add_column_if_missing(pool, "aggregation", "median", "REAL").await?;
    add_column_if_missing(pool, "aggregation", "first_quartile", "REAL").await?;
    add_column_if_missing(pool, "aggregation", "third_quartile", "REAL").await?;
    add_column_if_missing(
        pool,
        "measure_definition",
        "with_quartiles",
        "INTEGER NOT NULL DEFAULT 0",
    )
    .await?;
    Ok(())
}

/// Migration v2: purge tracking
///
/// Aggregates remember when their raw rows were purged, and definitions carry
/// the grace period during which quartile-bearing raw data is kept.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    add_column_if_missing(pool, "aggregation", "last_raw_measures_purged", "INTEGER").await?;
    add_column_if_missing(
        pool,
        "measure_definition",
        "max_days_to_update_quartile",
        "INTEGER NOT NULL DEFAULT 100",
    )
    .await?;
    Ok(())
}

/// Migration v3: lookup indexes and natural-key uniqueness
///
/// NULL slots are normalised in the unique index so that two aggregates with
/// the same key and a missing group still collide.
async fn migrate_v3(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_measure_name_last_updated \
         ON raw_measure (measure_name, last_updated)",
    )
    .execute(pool)
    .await?;

    // Ingestion timestamps are assigned from the table-wide maximum
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_measure_last_updated ON raw_measure (last_updated)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_aggregation_name_start_date \
         ON aggregation (measure_name, start_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_aggregation_natural_key ON aggregation (
            measure_name,
            start_date,
            IFNULL(created_by, ''),
            IFNULL(group1, ''),
            IFNULL(group2, ''),
            IFNULL(group3, '')
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration v4: refused raw measures archive and thresholded aggregate view
async fn migrate_v4(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS refused_raw_measure (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            measure_name TEXT NOT NULL,
            value REAL NOT NULL,
            start_date INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            aggregation_period TEXT,
            created_by TEXT,
            group1 TEXT,
            group2 TEXT,
            group3 TEXT,
            rejected_date INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE VIEW IF NOT EXISTS filtered_aggregation AS
        SELECT agg.*
        FROM aggregation AS agg
        WHERE agg.count >= (
            SELECT m.aggregation_threshold
            FROM measure_definition AS m
            WHERE m.name = agg.measure_name
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
