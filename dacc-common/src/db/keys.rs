//! Natural-key columns shared by raw measures and aggregates

use sqlx::{QueryBuilder, Sqlite};

use crate::db::models::{group_from_column, group_to_column, NaturalKey};
use crate::time::{from_micros, to_micros};
use crate::Result;

/// Stored form of a natural key
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct KeyRow {
    pub measure_name: String,
    pub start_date: i64,
    pub created_by: Option<String>,
    pub group1: Option<String>,
    pub group2: Option<String>,
    pub group3: Option<String>,
}

impl TryFrom<KeyRow> for NaturalKey {
    type Error = crate::Error;

    fn try_from(row: KeyRow) -> Result<Self> {
        Ok(NaturalKey {
            measure_name: row.measure_name,
            start_date: from_micros(row.start_date)?,
            created_by: row.created_by,
            group1: group_from_column(row.group1)?,
            group2: group_from_column(row.group2)?,
            group3: group_from_column(row.group3)?,
        })
    }
}

/// Append ` measure_name = ? AND ... AND group3 IS ?` matching exactly one key
///
/// `IS` makes a NULL slot equal to a NULL slot.
pub(crate) fn push_key_filter(qb: &mut QueryBuilder<'_, Sqlite>, key: &NaturalKey) {
    qb.push(" measure_name = ")
        .push_bind(key.measure_name.clone())
        .push(" AND start_date = ")
        .push_bind(to_micros(&key.start_date))
        .push(" AND created_by IS ")
        .push_bind(key.created_by.clone())
        .push(" AND group1 IS ")
        .push_bind(group_to_column(&key.group1))
        .push(" AND group2 IS ")
        .push_bind(group_to_column(&key.group2))
        .push(" AND group3 IS ")
        .push_bind(group_to_column(&key.group3));
}
