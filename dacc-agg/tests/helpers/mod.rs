//! Shared fixtures for dacc-agg integration tests
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use dacc_agg::{AggregationEngine, MeasureLocks, PurgeCoordinator};
use dacc_common::db::{
    aggregations, definitions, init_database, raw_measures, GroupLabel, MeasureDefinition,
    NaturalKey, RawMeasure,
};
use dacc_common::time;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Fresh database in a temporary directory, removed on drop
pub struct TestDb {
    _dir: TempDir,
    pub pool: SqlitePool,
    pub locks: MeasureLocks,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("dacc.db")).await.unwrap();
        Self {
            _dir: dir,
            pool,
            locks: MeasureLocks::new(),
        }
    }

    pub fn engine(&self) -> AggregationEngine {
        AggregationEngine::new(self.pool.clone(), self.locks.clone())
    }

    pub fn purger(&self) -> PurgeCoordinator {
        PurgeCoordinator::new(self.pool.clone(), self.locks.clone())
    }

    pub async fn define(&self, definition: MeasureDefinition) -> MeasureDefinition {
        let mut conn = self.pool.acquire().await.unwrap();
        definitions::upsert(&mut conn, &definition).await.unwrap()
    }

    /// Store a raw measure ingested now
    pub async fn insert(&self, key: &NaturalKey, value: f64) -> RawMeasure {
        self.insert_at(key, value, time::now()).await
    }

    /// Store a raw measure with a requested ingestion time
    ///
    /// The store still moves the timestamp past every earlier ingestion.
    pub async fn insert_at(&self, key: &NaturalKey, value: f64, at: DateTime<Utc>) -> RawMeasure {
        let mut conn = self.pool.acquire().await.unwrap();
        raw_measures::insert(&mut conn, key, value, None, at).await.unwrap()
    }

    pub async fn raw_count(&self, measure_name: &str) -> usize {
        let mut conn = self.pool.acquire().await.unwrap();
        raw_measures::list_by_name(&mut conn, measure_name).await.unwrap().len()
    }

    pub async fn aggregates(&self, measure_name: &str) -> Vec<dacc_common::db::Aggregation> {
        let mut conn = self.pool.acquire().await.unwrap();
        aggregations::list_by_name(&mut conn, measure_name).await.unwrap()
    }
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, d, 0, 0, 0).unwrap()
}

pub fn key(measure_name: &str, created_by: &str, d: u32) -> NaturalKey {
    NaturalKey {
        measure_name: measure_name.to_string(),
        start_date: day(d),
        created_by: Some(created_by.to_string()),
        group1: None,
        group2: None,
        group3: None,
    }
}

pub fn key_with_group(measure_name: &str, created_by: &str, d: u32, group_key: &str, value: &str) -> NaturalKey {
    NaturalKey {
        group1: Some(GroupLabel::new(group_key, value)),
        ..key(measure_name, created_by, d)
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}

/// Sample standard deviation computed directly
pub fn direct_std(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (squares / (values.len() - 1) as f64).sqrt()
}
