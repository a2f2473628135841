//! Measure definition registry queries

use sqlx::SqliteConnection;

use crate::db::models::{MeasureDefinition, Period};
use crate::Result;

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: i64,
    name: String,
    org: Option<String>,
    created_by: Option<String>,
    group1_key: Option<String>,
    group2_key: Option<String>,
    group3_key: Option<String>,
    description: Option<String>,
    aggregation_period: Option<String>,
    execution_frequency: Option<String>,
    aggregation_threshold: i64,
    access_app: bool,
    access_public: bool,
    with_quartiles: bool,
    max_days_to_update_quartile: i64,
}

impl TryFrom<DefinitionRow> for MeasureDefinition {
    type Error = crate::Error;

    fn try_from(row: DefinitionRow) -> Result<Self> {
        Ok(MeasureDefinition {
            id: row.id,
            name: row.name,
            org: row.org,
            created_by: row.created_by,
            group1_key: row.group1_key,
            group2_key: row.group2_key,
            group3_key: row.group3_key,
            description: row.description,
            aggregation_period: row
                .aggregation_period
                .as_deref()
                .map(str::parse::<Period>)
                .transpose()?,
            execution_frequency: row
                .execution_frequency
                .as_deref()
                .map(str::parse::<Period>)
                .transpose()?,
            aggregation_threshold: row.aggregation_threshold,
            access_app: row.access_app,
            access_public: row.access_public,
            with_quartiles: row.with_quartiles,
            max_days_to_update_quartile: row.max_days_to_update_quartile,
        })
    }
}

const SELECT_DEFINITION: &str = r#"
    SELECT id, name, org, created_by, group1_key, group2_key, group3_key,
           description, aggregation_period, execution_frequency,
           aggregation_threshold, access_app, access_public,
           with_quartiles, max_days_to_update_quartile
    FROM measure_definition
"#;

/// Look up a definition by its unique name
pub async fn find_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<MeasureDefinition>> {
    let row = sqlx::query_as::<_, DefinitionRow>(&format!("{} WHERE name = ?", SELECT_DEFINITION))
        .bind(name)
        .fetch_optional(conn)
        .await?;

    row.map(MeasureDefinition::try_from).transpose()
}

/// All definitions, ordered by name
pub async fn list_all(conn: &mut SqliteConnection) -> Result<Vec<MeasureDefinition>> {
    let rows = sqlx::query_as::<_, DefinitionRow>(&format!("{} ORDER BY name", SELECT_DEFINITION))
        .fetch_all(conn)
        .await?;

    rows.into_iter().map(MeasureDefinition::try_from).collect()
}

/// Insert a definition, or replace the settings of the one with the same name
///
/// Returns the definition with its store-assigned id.
pub async fn upsert(
    conn: &mut SqliteConnection,
    definition: &MeasureDefinition,
) -> Result<MeasureDefinition> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO measure_definition (
            name, org, created_by, group1_key, group2_key, group3_key,
            description, aggregation_period, execution_frequency,
            aggregation_threshold, access_app, access_public,
            with_quartiles, max_days_to_update_quartile
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            org = excluded.org,
            created_by = excluded.created_by,
            group1_key = excluded.group1_key,
            group2_key = excluded.group2_key,
            group3_key = excluded.group3_key,
            description = excluded.description,
            aggregation_period = excluded.aggregation_period,
            execution_frequency = excluded.execution_frequency,
            aggregation_threshold = excluded.aggregation_threshold,
            access_app = excluded.access_app,
            access_public = excluded.access_public,
            with_quartiles = excluded.with_quartiles,
            max_days_to_update_quartile = excluded.max_days_to_update_quartile
        RETURNING id
        "#,
    )
    .bind(&definition.name)
    .bind(&definition.org)
    .bind(&definition.created_by)
    .bind(&definition.group1_key)
    .bind(&definition.group2_key)
    .bind(&definition.group3_key)
    .bind(&definition.description)
    .bind(definition.aggregation_period.map(|p| p.as_str()))
    .bind(definition.execution_frequency.map(|p| p.as_str()))
    .bind(definition.aggregation_threshold)
    .bind(definition.access_app)
    .bind(definition.access_public)
    .bind(definition.with_quartiles)
    .bind(definition.max_days_to_update_quartile)
    .fetch_one(conn)
    .await?;

    Ok(MeasureDefinition {
        id,
        ..definition.clone()
    })
}
