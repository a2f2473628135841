//! Database initialization
//!
//! Creates the database file on first run, applies connection pragmas, creates
//! the base tables and then runs the versioned migrations in `migrations`.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every connection, in milliseconds
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL lets restitution reads proceed while an aggregation run writes
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Base schema (idempotent)
    create_schema_version_table(&pool).await?;
    create_measure_definition_table(&pool).await?;
    create_raw_measure_table(&pool).await?;
    create_aggregation_table(&pool).await?;
    create_aggregation_date_table(&pool).await?;

    // Later schema revisions
    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

/// Open a transaction that takes the write lock before its first read
///
/// A deferred transaction that reads and then writes fails with
/// `SQLITE_BUSY_SNAPSHOT` when another connection commits in between, and the
/// busy timeout does not retry that case. `BEGIN IMMEDIATE` waits for the lock
/// up front instead.
pub async fn begin_immediate(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the measure_definition table
///
/// One row per named measure: group labels, thresholds and cadence.
pub async fn create_measure_definition_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measure_definition (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            org TEXT,
            created_by TEXT,
            group1_key TEXT,
            group2_key TEXT,
            group3_key TEXT,
            description TEXT,
            aggregation_period TEXT,
            execution_frequency TEXT,
            aggregation_threshold INTEGER NOT NULL DEFAULT 5,
            access_app INTEGER NOT NULL DEFAULT 0,
            access_public INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the raw_measure table
///
/// Append-only observations. `last_updated` is the ingestion cursor.
pub async fn create_raw_measure_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_measure (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            measure_name TEXT NOT NULL,
            value REAL NOT NULL,
            start_date INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            aggregation_period TEXT,
            created_by TEXT,
            group1 TEXT,
            group2 TEXT,
            group3 TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the aggregation table
pub async fn create_aggregation_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            measure_name TEXT NOT NULL,
            start_date INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            created_by TEXT,
            group1 TEXT,
            group2 TEXT,
            group3 TEXT,
            sum REAL NOT NULL,
            count INTEGER NOT NULL CHECK (count > 0),
            count_not_zero INTEGER NOT NULL,
            min REAL NOT NULL,
            max REAL NOT NULL,
            avg REAL NOT NULL,
            std REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the aggregation_date table (per-measure watermark)
pub async fn create_aggregation_date_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregation_date (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            measure_definition_id INTEGER NOT NULL UNIQUE
                REFERENCES measure_definition(id) ON DELETE CASCADE,
            last_aggregated_measure_date INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
