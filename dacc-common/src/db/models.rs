//! Database models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::stats::{Quartiles, Summary};
use crate::{Error, Result};

/// Contribution count required before an aggregate is exposed
pub const DEFAULT_AGGREGATION_THRESHOLD: i64 = 5;

/// Days during which raw data is kept so quartiles can be recomputed
pub const DEFAULT_MAX_DAYS_TO_UPDATE_QUARTILE: i64 = 100;

/// Group value standing for "every value of this group"
pub const WILDCARD_VALUE: &str = "*";

/// Calendar period used for aggregation and execution frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Day,
    Week,
    Month,
}

impl Period {
    /// Length of the period in days
    pub fn days(&self) -> i64 {
        match self {
            Period::Day => 1,
            Period::Week => 7,
            Period::Month => 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            other => Err(Error::InvalidInput(format!("Unknown period: {}", other))),
        }
    }
}

/// One of the three classification slots of a measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupSlot {
    Group1,
    Group2,
    Group3,
}

impl GroupSlot {
    pub const ALL: [GroupSlot; 3] = [GroupSlot::Group1, GroupSlot::Group2, GroupSlot::Group3];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupSlot::Group1 => "group1",
            GroupSlot::Group2 => "group2",
            GroupSlot::Group3 => "group3",
        }
    }
}

impl FromStr for GroupSlot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "group1" => Ok(GroupSlot::Group1),
            "group2" => Ok(GroupSlot::Group2),
            "group3" => Ok(GroupSlot::Group3),
            other => Err(Error::InvalidInput(format!("Unknown group: {}", other))),
        }
    }
}

impl fmt::Display for GroupSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value of a group label, kept with its JSON type
///
/// `{"trigger": 42}` and `{"trigger": "42"}` are distinct classifications and
/// each is returned the way it was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupValue {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl GroupValue {
    fn rank(&self) -> u8 {
        match self {
            GroupValue::Bool(_) => 0,
            GroupValue::Number(_) => 1,
            GroupValue::Text(_) => 2,
        }
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        match self {
            GroupValue::Text(s) => serde_json::Value::String(s.clone()),
            GroupValue::Number(n) => serde_json::Value::Number(n.clone()),
            GroupValue::Bool(b) => serde_json::Value::Bool(*b),
        }
    }
}

// Ordering only has to be total and stable for grouping; numbers compare by
// their JSON text.
impl Ord for GroupValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (GroupValue::Text(a), GroupValue::Text(b)) => a.cmp(b),
            (GroupValue::Number(a), GroupValue::Number(b)) => a.to_string().cmp(&b.to_string()),
            (GroupValue::Bool(a), GroupValue::Bool(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for GroupValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for GroupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupValue::Text(s) => f.write_str(s),
            GroupValue::Number(n) => write!(f, "{}", n),
            GroupValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for GroupValue {
    fn from(value: &str) -> Self {
        GroupValue::Text(value.to_string())
    }
}

impl From<String> for GroupValue {
    fn from(value: String) -> Self {
        GroupValue::Text(value)
    }
}

impl From<i64> for GroupValue {
    fn from(value: i64) -> Self {
        GroupValue::Number(value.into())
    }
}

impl From<bool> for GroupValue {
    fn from(value: bool) -> Self {
        GroupValue::Bool(value)
    }
}

/// A single `label: value` classification, e.g. `{"device": "mobile"}`
///
/// Serialised as a one-entry JSON object. The value is a string, a number or
/// a boolean.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupLabel {
    pub key: String,
    pub value: GroupValue,
}

impl GroupLabel {
    pub fn new(key: impl Into<String>, value: impl Into<GroupValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Label matching every value of the group `key`
    pub fn wildcard(key: impl Into<String>) -> Self {
        Self::new(key, WILDCARD_VALUE)
    }

    /// Canonical stored form
    pub fn to_json(&self) -> String {
        let mut map = serde_json::Map::new();
        map.insert(self.key.clone(), self.value.to_json_value());
        serde_json::Value::Object(map).to_string()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Serialize for GroupLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.key, &self.value.to_json_value())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for GroupLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom("a group must hold exactly one label"));
        }
        let Some((key, value)) = map.into_iter().next() else {
            return Err(D::Error::custom("a group must hold exactly one label"));
        };
        let value = match value {
            serde_json::Value::String(s) => GroupValue::Text(s),
            serde_json::Value::Number(n) => GroupValue::Number(n),
            serde_json::Value::Bool(b) => GroupValue::Bool(b),
            _ => {
                return Err(D::Error::custom(
                    "a group value must be a string, a number or a boolean",
                ))
            }
        };
        Ok(GroupLabel { key, value })
    }
}

/// Stored form of an optional group slot
pub fn group_to_column(group: &Option<GroupLabel>) -> Option<String> {
    group.as_ref().map(GroupLabel::to_json)
}

/// Parse an optional group slot read back from the database
pub fn group_from_column(column: Option<String>) -> Result<Option<GroupLabel>> {
    column.as_deref().map(GroupLabel::from_json).transpose()
}

/// Static per-measure configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureDefinition {
    /// Assigned by the store
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub group1_key: Option<String>,
    #[serde(default)]
    pub group2_key: Option<String>,
    #[serde(default)]
    pub group3_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aggregation_period: Option<Period>,
    #[serde(default)]
    pub execution_frequency: Option<Period>,
    #[serde(default = "default_aggregation_threshold")]
    pub aggregation_threshold: i64,
    #[serde(default)]
    pub access_app: bool,
    #[serde(default)]
    pub access_public: bool,
    #[serde(default)]
    pub with_quartiles: bool,
    #[serde(default = "default_max_days_to_update_quartile")]
    pub max_days_to_update_quartile: i64,
}

fn default_aggregation_threshold() -> i64 {
    DEFAULT_AGGREGATION_THRESHOLD
}

fn default_max_days_to_update_quartile() -> i64 {
    DEFAULT_MAX_DAYS_TO_UPDATE_QUARTILE
}

impl MeasureDefinition {
    /// Definition with default settings and no groups
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            org: None,
            created_by: None,
            group1_key: None,
            group2_key: None,
            group3_key: None,
            description: None,
            aggregation_period: None,
            execution_frequency: None,
            aggregation_threshold: DEFAULT_AGGREGATION_THRESHOLD,
            access_app: false,
            access_public: false,
            with_quartiles: false,
            max_days_to_update_quartile: DEFAULT_MAX_DAYS_TO_UPDATE_QUARTILE,
        }
    }

    /// Label name of a group slot, `None` when the measure has no such group
    pub fn group_key(&self, slot: GroupSlot) -> Option<&str> {
        match slot {
            GroupSlot::Group1 => self.group1_key.as_deref(),
            GroupSlot::Group2 => self.group2_key.as_deref(),
            GroupSlot::Group3 => self.group3_key.as_deref(),
        }
    }

    /// Minimum interval between two aggregation runs
    pub fn execution_period(&self) -> Period {
        self.execution_frequency.unwrap_or_default()
    }
}

/// Identity of one aggregate row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub measure_name: String,
    pub start_date: DateTime<Utc>,
    pub created_by: Option<String>,
    pub group1: Option<GroupLabel>,
    pub group2: Option<GroupLabel>,
    pub group3: Option<GroupLabel>,
}

impl NaturalKey {
    pub fn group(&self, slot: GroupSlot) -> &Option<GroupLabel> {
        match slot {
            GroupSlot::Group1 => &self.group1,
            GroupSlot::Group2 => &self.group2,
            GroupSlot::Group3 => &self.group3,
        }
    }

    pub fn group_mut(&mut self, slot: GroupSlot) -> &mut Option<GroupLabel> {
        match slot {
            GroupSlot::Group1 => &mut self.group1,
            GroupSlot::Group2 => &mut self.group2,
            GroupSlot::Group3 => &mut self.group3,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} by {}",
            self.measure_name,
            self.start_date.to_rfc3339(),
            self.created_by.as_deref().unwrap_or("null")
        )?;
        for slot in GroupSlot::ALL {
            if let Some(label) = self.group(slot) {
                write!(f, " {}={}", label.key, label.value)?;
            }
        }
        Ok(())
    }
}

/// One submitted observation
#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasure {
    pub id: i64,
    pub key: NaturalKey,
    pub value: f64,
    /// Ingestion timestamp, strictly increasing across the table
    pub last_updated: DateTime<Utc>,
    pub aggregation_period: Option<String>,
}

/// Raw measure as accepted by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMeasure {
    pub measure_name: String,
    pub value: f64,
    pub start_date: String,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub aggregation_period: Option<String>,
    #[serde(default)]
    pub group1: Option<GroupLabel>,
    #[serde(default)]
    pub group2: Option<GroupLabel>,
    #[serde(default)]
    pub group3: Option<GroupLabel>,
}

impl IncomingMeasure {
    pub fn group(&self, slot: GroupSlot) -> &Option<GroupLabel> {
        match slot {
            GroupSlot::Group1 => &self.group1,
            GroupSlot::Group2 => &self.group2,
            GroupSlot::Group3 => &self.group3,
        }
    }
}

/// Statistics of one natural-key group, computed from raw measures
#[derive(Debug, Clone, PartialEq)]
pub struct PartialAggregate {
    pub key: NaturalKey,
    pub summary: Summary,
    pub quartiles: Option<Quartiles>,
}

/// Persisted statistical summary of one natural key
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    /// `None` until the row is inserted
    pub id: Option<i64>,
    pub key: NaturalKey,
    pub summary: Summary,
    /// Only kept when the definition declares quartiles
    pub quartiles: Option<Quartiles>,
    pub last_updated: DateTime<Utc>,
    /// Set once raw rows below this aggregate have been purged
    pub last_raw_measures_purged: Option<DateTime<Utc>>,
}

impl Aggregation {
    /// New aggregate built straight from grouped raw measures
    pub fn from_partial(
        definition: &MeasureDefinition,
        partial: PartialAggregate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            key: partial.key,
            summary: partial.summary,
            quartiles: if definition.with_quartiles {
                partial.quartiles
            } else {
                None
            },
            last_updated: now,
            last_raw_measures_purged: None,
        }
    }

    /// Fold newly grouped raw measures into this aggregate
    ///
    /// Quartiles are left untouched: they cannot be merged and must be
    /// recomputed from raw data by the caller.
    pub fn merge(&self, partial: &PartialAggregate, now: DateTime<Utc>) -> Result<Aggregation> {
        if self.key.measure_name != partial.key.measure_name {
            return Err(Error::MergeConflict(format!(
                "Cannot compute aggregation on different measures: {} - {}",
                self.key.measure_name, partial.key.measure_name
            )));
        }
        if self.key.start_date != partial.key.start_date {
            return Err(Error::MergeConflict(format!(
                "Cannot compute aggregation on different dates: {} - {}",
                self.key.start_date, partial.key.start_date
            )));
        }

        Ok(Aggregation {
            summary: self.summary.merge(&partial.summary),
            last_updated: now,
            ..self.clone()
        })
    }
}

/// Raw measure archived because its aggregate could no longer be merged
#[derive(Debug, Clone, PartialEq)]
pub struct RefusedRawMeasure {
    pub id: i64,
    pub key: NaturalKey,
    pub value: f64,
    pub last_updated: DateTime<Utc>,
    pub aggregation_period: Option<String>,
    pub rejected_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(measure: &str, day: u32) -> NaturalKey {
        NaturalKey {
            measure_name: measure.to_string(),
            start_date: Utc.with_ymd_and_hms(2022, 1, day, 0, 0, 0).unwrap(),
            created_by: Some("dummy-app".to_string()),
            group1: Some(GroupLabel::new("key1", "1")),
            group2: None,
            group3: None,
        }
    }

    fn partial(measure: &str, day: u32, values: &[f64]) -> PartialAggregate {
        PartialAggregate {
            key: key(measure, day),
            summary: Summary::from_values(values).unwrap(),
            quartiles: Quartiles::from_values(values),
        }
    }

    #[test]
    fn test_group_label_keeps_number_type() {
        let label: GroupLabel = serde_json::from_str(r#"{"key1": 1}"#).unwrap();
        assert_eq!(label, GroupLabel::new("key1", 1));
        assert_ne!(label, GroupLabel::new("key1", "1"));
        assert_eq!(label.to_json(), r#"{"key1":1}"#);

        let flag: GroupLabel = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert_eq!(serde_json::to_string(&flag).unwrap(), r#"{"enabled":true}"#);
    }

    #[test]
    fn test_group_label_rejects_several_entries() {
        let result: std::result::Result<GroupLabel, _> =
            serde_json::from_str(r#"{"a": "x", "b": "y"}"#);
        assert!(result.is_err());
        let result: std::result::Result<GroupLabel, _> = serde_json::from_str("{}");
        assert!(result.is_err());
    }

    #[test]
    fn test_group_column_roundtrip() {
        let group = Some(GroupLabel::new("device", "mobile"));
        let column = group_to_column(&group);
        assert_eq!(group_from_column(column).unwrap(), group);
        assert_eq!(group_from_column(None).unwrap(), None);
    }

    #[test]
    fn test_definition_defaults_from_json() {
        let def: MeasureDefinition = serde_json::from_str(
            r#"{"name": "connection-count-daily", "group1Key": "device", "executionFrequency": "week"}"#,
        )
        .unwrap();
        assert_eq!(def.group1_key.as_deref(), Some("device"));
        assert_eq!(def.aggregation_threshold, DEFAULT_AGGREGATION_THRESHOLD);
        assert_eq!(def.max_days_to_update_quartile, DEFAULT_MAX_DAYS_TO_UPDATE_QUARTILE);
        assert_eq!(def.execution_period(), Period::Week);
        assert!(!def.with_quartiles);
    }

    #[test]
    fn test_execution_period_defaults_to_day() {
        assert_eq!(MeasureDefinition::new("m").execution_period(), Period::Day);
        assert_eq!("month".parse::<Period>().unwrap().days(), 30);
        assert!("year".parse::<Period>().is_err());
    }

    #[test]
    fn test_merge_rejects_other_measure() {
        let def = MeasureDefinition::new("a");
        let current = Aggregation::from_partial(&def, partial("a", 1, &[1.0]), Utc::now());
        let err = current.merge(&partial("b", 1, &[2.0]), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::MergeConflict(_)));
    }

    #[test]
    fn test_merge_rejects_other_date() {
        let def = MeasureDefinition::new("a");
        let current = Aggregation::from_partial(&def, partial("a", 1, &[1.0]), Utc::now());
        let err = current.merge(&partial("a", 2, &[2.0]), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::MergeConflict(_)));
    }

    #[test]
    fn test_from_partial_drops_quartiles_when_not_declared() {
        let def = MeasureDefinition::new("a");
        let agg = Aggregation::from_partial(&def, partial("a", 1, &[1.0, 2.0]), Utc::now());
        assert!(agg.quartiles.is_none());

        let mut def = MeasureDefinition::new("a");
        def.with_quartiles = true;
        let agg = Aggregation::from_partial(&def, partial("a", 1, &[1.0, 2.0]), Utc::now());
        assert!(agg.quartiles.is_some());
    }
}
