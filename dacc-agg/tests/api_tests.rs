//! Integration tests for dacc-agg HTTP endpoints

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use dacc_agg::{build_router, AppState};
use dacc_common::db::{MeasureDefinition, Period};
use helpers::TestDb;
use serde_json::{json, Value};
use tower::util::ServiceExt; // for `oneshot` method

fn setup_app(db: &TestDb) -> axum::Router {
    build_router(AppState::new(db.pool.clone()))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

async fn define_konnector(db: &TestDb, access_app: bool) -> MeasureDefinition {
    let mut definition = MeasureDefinition::new("konnector-trigger");
    definition.group1_key = Some("slug".to_string());
    definition.execution_frequency = Some(Period::Day);
    definition.aggregation_threshold = 2;
    definition.access_app = access_app;
    db.define(definition).await
}

fn measure(slug: &str, value: f64) -> Value {
    json!({
        "measureName": "konnector-trigger",
        "value": value,
        "startDate": "2022-01-01",
        "createdBy": "dummy-app",
        "group1": { "slug": slug }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let db = TestDb::new().await;
    let app = setup_app(&db);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "dacc-agg");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_post_measure_stores_raw_measure() {
    let db = TestDb::new().await;
    define_konnector(&db, true).await;

    let response = setup_app(&db)
        .oneshot(json_request("POST", "/measure", measure("dummy", 3.0)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["measureName"], "konnector-trigger");
    assert_eq!(db.raw_count("konnector-trigger").await, 1);
}

#[tokio::test]
async fn test_post_measure_with_wrong_group_is_bad_request() {
    let db = TestDb::new().await;
    define_konnector(&db, true).await;
    let mut body = measure("dummy", 1.0);
    body["group1"] = json!({ "other": "dummy" });

    let response = setup_app(&db)
        .oneshot(json_request("POST", "/measure", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = extract_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("group1"));
    assert_eq!(db.raw_count("konnector-trigger").await, 0);
}

#[tokio::test]
async fn test_post_unknown_measure_is_not_found() {
    let db = TestDb::new().await;
    let mut body = measure("dummy", 1.0);
    body["measureName"] = json!("unknown");

    let response = setup_app(&db)
        .oneshot(json_request("POST", "/measure", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_aggregate_forbidden_without_app_access() {
    let db = TestDb::new().await;
    define_konnector(&db, false).await;

    let query = json!({
        "measureName": "konnector-trigger",
        "startDate": "2022-01-01",
        "endDate": "2022-02-01"
    });
    let response = setup_app(&db)
        .oneshot(json_request("POST", "/aggregate", query))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_post_aggregate_returns_results_over_threshold() {
    let db = TestDb::new().await;
    let definition = define_konnector(&db, true).await;

    for (slug, value) in [("dummy", 1.0), ("dummy", 2.0), ("lonely", 5.0)] {
        let response = setup_app(&db)
            .oneshot(json_request("POST", "/measure", measure(slug, value)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let query = json!({
        "measureName": "konnector-trigger",
        "createdBy": "dummy-app",
        "startDate": "2022-01-01",
        "endDate": "2022-02-01"
    });
    let response = setup_app(&db)
        .oneshot(json_request("POST", "/aggregate", query))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    let results = body.as_array().unwrap();
    assert_eq!(results.len(), 1, "group below threshold must be suppressed");
    assert_eq!(results[0]["group1"]["slug"], "dummy");
    assert_eq!(results[0]["count"], 2);
    assert_eq!(results[0]["sum"], 3.0);
    assert!(results[0].get("median").is_none());
}
