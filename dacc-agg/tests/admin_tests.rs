//! Wildcard roll-up and rollback tests

mod helpers;

use chrono::Duration;
use dacc_common::db::{watermarks, GroupLabel, GroupSlot, MeasureDefinition, Period};
use dacc_common::{time, Error};
use helpers::{day, key, key_with_group, TestDb};

fn definition(name: &str) -> MeasureDefinition {
    let mut definition = MeasureDefinition::new(name);
    definition.execution_frequency = Some(Period::Day);
    definition.group1_key = Some("slug".to_string());
    definition
}

#[tokio::test]
async fn test_wildcard_collapses_group_and_replaces_previous() {
    let db = TestDb::new().await;
    let definition = db.define(definition("konnector")).await;
    for (slug, value) in [("x", 20.0), ("y", 40.0), ("z", 60.0)] {
        db.insert(&key_with_group("konnector", "app", 1, "slug", slug), value).await;
    }
    let from = time::now() - Duration::days(1);
    let to = time::now() + Duration::days(1);

    let inserted = db
        .engine()
        .compute_wildcard_aggregate(&definition, &[GroupSlot::Group1], &from, &to)
        .await
        .unwrap();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].key.group1, Some(GroupLabel::wildcard("slug")));
    assert_eq!(inserted[0].summary.count, 3);

    db.engine()
        .compute_wildcard_aggregate(&definition, &[GroupSlot::Group1], &from, &to)
        .await
        .unwrap();

    let stored = db.aggregates("konnector").await;
    assert_eq!(stored.len(), 1, "wildcard aggregate is replaced, not merged");
    assert_eq!(stored[0].summary.count, 3);
    assert_eq!(stored[0].summary.sum, 120.0);
}

#[tokio::test]
async fn test_wildcard_rejects_slot_without_key() {
    let db = TestDb::new().await;
    let definition = db.define(definition("konnector")).await;
    let now = time::now();

    let result = db
        .engine()
        .compute_wildcard_aggregate(&definition, &[GroupSlot::Group2], &now, &now)
        .await;

    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_rollback_rebuilds_later_buckets() {
    let db = TestDb::new().await;
    let definition = db.define(definition("rollback")).await;
    let plain = |d| key_with_group("rollback", "app", d, "slug", "x");

    db.insert(&plain(1), 1.0).await;
    let first_day2 = db.insert(&plain(2), 2.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();
    db.insert(&plain(2), 3.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let report = db.engine().rollback_aggregates(&definition, &day(2)).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(
        report.watermark,
        Some(first_day2.last_updated - Duration::microseconds(1))
    );
    assert_eq!(db.aggregates("rollback").await.len(), 1);

    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let stored = db.aggregates("rollback").await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].summary.count, 1);
    assert_eq!(stored[1].summary.count, 2);
    assert_eq!(stored[1].summary.sum, 5.0);
}

#[tokio::test]
async fn test_rollback_refused_when_older_bucket_would_be_merged_twice() {
    let db = TestDb::new().await;
    let definition = db.define(definition("interleaved")).await;
    let plain = |d| key_with_group("interleaved", "app", d, "slug", "x");

    db.insert(&plain(2), 1.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();
    db.insert(&plain(1), 2.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let before = watermarks::get(&mut conn, "interleaved").await.unwrap();
    drop(conn);

    let result = db.engine().rollback_aggregates(&definition, &day(2)).await;
    assert!(matches!(result, Err(Error::RollbackConflict(_))));

    assert_eq!(db.aggregates("interleaved").await.len(), 2);
    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(watermarks::get(&mut conn, "interleaved").await.unwrap(), before);
}

#[tokio::test]
async fn test_rollback_refused_after_purge() {
    let db = TestDb::new().await;
    let definition = db.define(definition("purged")).await;
    db.insert(&key_with_group("purged", "app", 1, "slug", "x"), 1.0).await;
    db.engine().aggregate(&definition, true).await.unwrap().unwrap();
    db.purger().purge(&definition, None).await.unwrap();

    let result = db.engine().rollback_aggregates(&definition, &day(1)).await;

    assert!(matches!(result, Err(Error::RollbackConflict(_))));
    assert_eq!(db.aggregates("purged").await.len(), 1);
}

#[tokio::test]
async fn test_rollback_without_aggregates_changes_nothing() {
    let db = TestDb::new().await;
    let definition = db.define(definition("untouched")).await;
    db.insert(&key("untouched", "app", 1), 1.0).await;

    let report = db.engine().rollback_aggregates(&definition, &day(1)).await.unwrap();

    assert_eq!(report.deleted, 0);
    assert_eq!(report.watermark, None);
}
