//! Input validation and the execution-frequency throttle

use chrono::{DateTime, Utc};
use dacc_common::db::{GroupSlot, IncomingMeasure, MeasureDefinition, NaturalKey, Period};
use dacc_common::time::parse_date;
use dacc_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Restitution query as received from clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsQuery {
    pub measure_name: String,
    #[serde(default)]
    pub created_by: Option<String>,
    pub start_date: String,
    pub end_date: String,
}

/// Parsed and checked restitution query bounds
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsWindow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_by: Option<String>,
}

/// Whole elapsed days between `start` and `end` cover at least one `period`
pub fn is_dates_interval_higher(start: &DateTime<Utc>, end: &DateTime<Utc>, period: Period) -> bool {
    (*end - *start).num_days() / period.days() >= 1
}

/// A new aggregation run is due for `definition`
///
/// A measure that was never aggregated is always due.
pub fn is_execution_frequency_respected(
    definition: &MeasureDefinition,
    last_aggregated: Option<&DateTime<Utc>>,
    now: &DateTime<Utc>,
) -> bool {
    match last_aggregated {
        Some(start) => is_dates_interval_higher(start, now, definition.execution_period()),
        None => true,
    }
}

/// Check an incoming measure against its definition and build its natural key
pub fn validate_incoming_measure(
    definition: &MeasureDefinition,
    measure: &IncomingMeasure,
) -> Result<NaturalKey> {
    if measure.measure_name != definition.name {
        return Err(Error::InvalidInput(format!(
            "No measure definition found for: {}",
            measure.measure_name
        )));
    }

    if !measure.value.is_finite() {
        return Err(Error::InvalidInput(
            "value type is incorrect, it must be a number".to_string(),
        ));
    }

    let start_date = parse_date(&measure.start_date)
        .map_err(|_| Error::InvalidInput("startDate type is incorrect, it must be a date".to_string()))?;

    if measure.created_by.as_deref().is_some_and(str::is_empty) {
        return Err(Error::InvalidInput("createdBy cannot be empty".to_string()));
    }

    for slot in GroupSlot::ALL {
        let given = measure.group(slot).as_ref().map(|label| label.key.as_str());
        if given != definition.group_key(slot) {
            return Err(Error::InvalidInput(format!(
                "{} key does not match measure definition: {}",
                slot,
                given.unwrap_or("null")
            )));
        }
    }

    Ok(NaturalKey {
        measure_name: definition.name.clone(),
        start_date,
        created_by: measure.created_by.clone(),
        group1: measure.group1.clone(),
        group2: measure.group2.clone(),
        group3: measure.group3.clone(),
    })
}

/// Check a restitution query against its definition
pub fn validate_results_query(
    definition: &MeasureDefinition,
    query: &ResultsQuery,
) -> Result<ResultsWindow> {
    if !definition.access_app {
        return Err(Error::AccessDenied(format!(
            "You cannot access results for this measure: {}",
            definition.name
        )));
    }

    let start_date = parse_date(&query.start_date)
        .map_err(|_| Error::InvalidInput("startDate type is incorrect, it must be a date".to_string()))?;
    let end_date = parse_date(&query.end_date)
        .map_err(|_| Error::InvalidInput("endDate type is incorrect, it must be a date".to_string()))?;

    if start_date >= end_date {
        return Err(Error::InvalidInput(
            "startDate must be before endDate".to_string(),
        ));
    }

    Ok(ResultsWindow {
        start_date,
        end_date,
        created_by: query.created_by.clone(),
    })
}
