//! Store-level integration tests. They need a live PostgreSQL instance
//! (POSTGRES_* environment variables) and are ignored by default:
//!
//! ```sh
//! POSTGRES_DB=unit_linkage_test cargo test -- --ignored
//! ```

use chrono::Utc;
use linkage_lib::models::{
    derive_match_id, LinkageResult, MatchExplanation, MatchType, ReviewStatus, Unit,
};
use linkage_lib::store::results::ResultStore;
use linkage_lib::store::{connect, schema, PgPool};

async fn test_pool() -> PgPool {
    let pool = connect().await.expect("test database must be reachable");
    schema::ensure_schema(&pool).await.expect("schema");
    pool
}

fn sample_result(primary_id: &str) -> LinkageResult {
    let primary = Unit {
        id: primary_id.into(),
        name: "测试排查单位".into(),
        credit_code: Some("91350100TEST00001X".into()),
        ..Unit::default()
    };
    let matched = Unit {
        id: "S-ROUNDTRIP".into(),
        name: "测试监管单位".into(),
        credit_code: Some("91350100TEST00001X".into()),
        ..Unit::default()
    };
    LinkageResult::new(
        &primary,
        Some(&matched),
        MatchType::ExactCreditCode,
        1.0,
        MatchExplanation::default().positive("credit codes equal"),
        Utc::now(),
    )
}

#[tokio::test]
#[ignore]
async fn upsert_replaces_rather_than_duplicates() {
    let pool = test_pool().await;
    let store = ResultStore::new(pool);
    let result = sample_result("IT-P1");

    let first = store.upsert(&result).await.unwrap();
    assert_eq!(first.inserted, 1);

    let mut rerun = result.clone();
    rerun.updated_time = Utc::now();
    let second = store.upsert(&rerun).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.modified, 1);

    let stored = store.get("IT-P1").await.unwrap().unwrap();
    assert_eq!(stored.match_id, derive_match_id("IT-P1", Some("S-ROUNDTRIP")));
    assert_eq!(stored.created_time, result.created_time);
    // Identifier fields round-trip byte-for-byte.
    assert_eq!(stored.primary_credit_code.as_deref(), Some("91350100TEST00001X"));
}

#[tokio::test]
#[ignore]
async fn review_cas_detects_concurrent_update() {
    let pool = test_pool().await;
    let store = ResultStore::new(pool);
    let result = sample_result("IT-P2");
    store.upsert(&result).await.unwrap();
    let stored = store.get("IT-P2").await.unwrap().unwrap();

    let approved = store
        .set_review(
            &stored.match_id,
            ReviewStatus::Approved,
            Some("verified by hand"),
            "reviewer-a",
            stored.updated_time,
            stored.review_status,
        )
        .await
        .unwrap();
    assert_eq!(approved.review_status, ReviewStatus::Approved);
    assert!(approved.review_timestamp.is_some());

    // A second writer holding the stale timestamp must be refused.
    let stale = store
        .set_review(
            &stored.match_id,
            ReviewStatus::Pending,
            None,
            "reviewer-b",
            stored.updated_time,
            approved.review_status,
        )
        .await;
    assert!(stale.is_err());
}

#[tokio::test]
#[ignore]
async fn review_fields_survive_update_mode_upsert() {
    let pool = test_pool().await;
    let store = ResultStore::new(pool);
    let result = sample_result("IT-P3");
    store.upsert(&result).await.unwrap();
    let stored = store.get("IT-P3").await.unwrap().unwrap();

    store
        .set_review(
            &stored.match_id,
            ReviewStatus::Approved,
            None,
            "reviewer-a",
            stored.updated_time,
            stored.review_status,
        )
        .await
        .unwrap();

    // Re-running the pipeline overwrites the decision but not the review.
    let mut rerun = result.clone();
    rerun.updated_time = Utc::now();
    store.upsert(&rerun).await.unwrap();

    let after = store.get("IT-P3").await.unwrap().unwrap();
    assert_eq!(after.review_status, ReviewStatus::Approved);
    assert_eq!(after.reviewer.as_deref(), Some("reviewer-a"));
}
