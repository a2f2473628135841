//! Raw measure and definition ingestion

use std::collections::HashMap;
use std::path::Path;

use dacc_common::db::{
    begin_immediate, definitions, raw_measures, IncomingMeasure, MeasureDefinition, RawMeasure,
};
use dacc_common::{time, Error, Result};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::purge::quartile_retention_start;
use crate::validate::validate_incoming_measure;

async fn find_definition(conn: &mut SqliteConnection, name: &str) -> Result<MeasureDefinition> {
    definitions::find_by_name(conn, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("No measure definition found for: {}", name)))
}

/// Validate and store one raw measure
pub async fn insert_raw_measure(pool: &SqlitePool, measure: &IncomingMeasure) -> Result<RawMeasure> {
    let mut conn = pool.acquire().await?;
    let definition = find_definition(&mut conn, &measure.measure_name).await?;
    let key = validate_incoming_measure(&definition, measure)?;

    let raw = raw_measures::insert(
        &mut conn,
        &key,
        measure.value,
        measure.aggregation_period.as_deref(),
        time::now(),
    )
    .await?;

    debug!(measure = %key.measure_name, id = raw.id, "Raw measure stored");
    Ok(raw)
}

/// Create or replace a measure definition, keyed by name
pub async fn insert_measure_definition(
    pool: &SqlitePool,
    definition: &MeasureDefinition,
) -> Result<MeasureDefinition> {
    if definition.name.is_empty() {
        return Err(Error::InvalidInput("A measure name must be given".to_string()));
    }
    if definition.aggregation_threshold < 1 {
        return Err(Error::InvalidInput(format!(
            "aggregationThreshold of {} must be at least 1",
            definition.name
        )));
    }
    quartile_retention_start(definition.max_days_to_update_quartile, time::now())?;

    let mut conn = pool.acquire().await?;
    definitions::upsert(&mut conn, definition).await
}

/// Load a JSON array of definitions
pub async fn load_definitions_file(pool: &SqlitePool, path: &Path) -> Result<Vec<MeasureDefinition>> {
    let content = tokio::fs::read_to_string(path).await?;
    let incoming: Vec<MeasureDefinition> = serde_json::from_str(&content)?;

    let mut stored = Vec::with_capacity(incoming.len());
    for definition in &incoming {
        stored.push(insert_measure_definition(pool, definition).await?);
    }

    info!("Loaded {} measure definitions from {}", stored.len(), path.display());
    Ok(stored)
}

/// Load a JSON array of raw measures
///
/// Every measure is validated first; the file is stored in one transaction so
/// a single invalid entry leaves the store untouched.
pub async fn load_measures_file(pool: &SqlitePool, path: &Path) -> Result<Vec<RawMeasure>> {
    let content = tokio::fs::read_to_string(path).await?;
    let incoming: Vec<IncomingMeasure> = serde_json::from_str(&content)?;

    let mut tx = begin_immediate(pool).await?;
    let mut known: HashMap<String, MeasureDefinition> = HashMap::new();
    let mut stored = Vec::with_capacity(incoming.len());

    for measure in &incoming {
        if !known.contains_key(&measure.measure_name) {
            let definition = find_definition(&mut *tx, &measure.measure_name).await?;
            known.insert(measure.measure_name.clone(), definition);
        }
        let definition = &known[&measure.measure_name];
        let key = validate_incoming_measure(definition, measure)?;

        let raw = raw_measures::insert(
            &mut *tx,
            &key,
            measure.value,
            measure.aggregation_period.as_deref(),
            time::now(),
        )
        .await?;
        stored.push(raw);
    }

    tx.commit().await?;

    info!("Loaded {} raw measures from {}", stored.len(), path.display());
    Ok(stored)
}
