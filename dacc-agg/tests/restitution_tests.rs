//! Threshold-filtered restitution tests

mod helpers;

use dacc_agg::restitution::{get_results, query_results};
use dacc_agg::validate::ResultsQuery;
use dacc_common::db::{GroupLabel, MeasureDefinition, Period};
use dacc_common::Error;
use helpers::{day, key, key_with_group, TestDb};

fn definition(name: &str, threshold: i64) -> MeasureDefinition {
    let mut definition = MeasureDefinition::new(name);
    definition.execution_frequency = Some(Period::Day);
    definition.aggregation_threshold = threshold;
    definition.access_app = true;
    definition
}

#[tokio::test]
async fn test_aggregate_below_threshold_is_suppressed() {
    let db = TestDb::new().await;
    let definition = db.define(definition("private", 3)).await;
    let group = key("private", "app", 1);

    db.insert(&group, 1.0).await;
    db.insert(&group, 2.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let results = get_results(&db.pool, "private", None, &day(1), &day(2)).await.unwrap();
    assert!(results.is_empty());

    db.insert(&group, 3.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let results = get_results(&db.pool, "private", None, &day(1), &day(2)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].count, 3);
    assert_eq!(results[0].sum, 6.0);
}

#[tokio::test]
async fn test_results_window_and_creator_filter() {
    let db = TestDb::new().await;
    let definition = db.define(definition("window", 1)).await;

    db.insert(&key("window", "app-a", 1), 1.0).await;
    db.insert(&key("window", "app-b", 1), 2.0).await;
    db.insert(&key("window", "app-a", 2), 3.0).await;
    db.insert(&key("window", "app-a", 3), 4.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let results = get_results(&db.pool, "window", None, &day(1), &day(3)).await.unwrap();
    assert_eq!(results.len(), 3, "end date is exclusive");
    assert!(results.windows(2).all(|w| w[0].start_date <= w[1].start_date));

    let results = get_results(&db.pool, "window", Some("app-a"), &day(1), &day(3))
        .await
        .unwrap();
    let sums: Vec<f64> = results.iter().map(|r| r.sum).collect();
    assert_eq!(sums, vec![1.0, 3.0]);
}

#[tokio::test]
async fn test_null_fields_are_omitted() {
    let db = TestDb::new().await;
    let definition = db.define(definition("omit", 1)).await;
    db.insert(&key_with_group("omit", "app", 1, "slug", "dummy"), 5.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let results = get_results(&db.pool, "omit", None, &day(1), &day(2)).await.unwrap();
    let json = serde_json::to_value(&results[0]).unwrap();

    assert_eq!(json["measureName"], "omit");
    assert_eq!(json["createdBy"], "app");
    assert_eq!(json["group1"]["slug"], "dummy");
    assert_eq!(json["countNotZero"], 1);
    assert!(json.get("group2").is_none());
    assert!(json.get("median").is_none());
}

#[tokio::test]
async fn test_query_requires_app_access() {
    let db = TestDb::new().await;
    let mut closed = definition("closed", 1);
    closed.access_app = false;
    db.define(closed).await;

    let query = ResultsQuery {
        measure_name: "closed".to_string(),
        created_by: None,
        start_date: "2022-01-01".to_string(),
        end_date: "2022-02-01".to_string(),
    };
    assert!(matches!(
        query_results(&db.pool, &query).await,
        Err(Error::AccessDenied(_))
    ));

    let unknown = ResultsQuery {
        measure_name: "unknown".to_string(),
        ..query
    };
    assert!(matches!(
        query_results(&db.pool, &unknown).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_group_values_keep_their_json_type() {
    let db = TestDb::new().await;
    let definition = db.define(definition("typed", 1)).await;

    let mut numeric = key("typed", "app", 1);
    numeric.group1 = Some(GroupLabel::new("trigger", 42));
    let mut text = key("typed", "app", 1);
    text.group1 = Some(GroupLabel::new("trigger", "42"));

    db.insert(&numeric, 1.0).await;
    db.insert(&text, 2.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let results = get_results(&db.pool, "typed", None, &day(1), &day(2)).await.unwrap();
    assert_eq!(results.len(), 2);

    let groups: Vec<serde_json::Value> = results
        .iter()
        .map(|r| serde_json::to_value(&r.group1).unwrap())
        .collect();
    assert!(groups.contains(&serde_json::json!({"trigger": 42})));
    assert!(groups.contains(&serde_json::json!({"trigger": "42"})));
}
