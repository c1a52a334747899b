use std::sync::Arc;

use serde_json::json;

use super::{create_app, doc, FakeProvider};
use crate::app::{task_runner::Status, AppError, AppLocal, BatchCounts};
use crate::documents::{Collection, DocumentStore, MemoryDocuments};
use crate::entities::EntityKind;

fn seed(docs: &MemoryDocuments) {
    docs.set(
        Collection::Profiles,
        "ava",
        doc(json!({
            "displayName": "Ava",
            "bio": "",
            "location": "Lisbon",
            "interests": ["hiking", "outdoors"],
            "updatedAt": "2024-05-01T10:00:00Z"
        })),
    )
    .unwrap();
    docs.set(
        Collection::Profiles,
        "ben",
        doc(json!({
            "displayName": "Ben",
            "interests": ["music", "coffee"],
            "updatedAt": "2024-01-01T10:00:00Z"
        })),
    )
    .unwrap();
    docs.set(
        Collection::Items,
        "trail",
        doc(json!({
            "title": "Hiking the coast",
            "category": "outdoors",
            "updatedAt": "2024-05-02T10:00:00Z"
        })),
    )
    .unwrap();
    docs.set(
        Collection::Items,
        "gig",
        doc(json!({
            "title": "Jazz night",
            "category": "music",
            "description": "Live music with coffee",
            "updatedAt": "2024-05-03T10:00:00Z"
        })),
    )
    .unwrap();
}

/// Runs `f` with a live queue and waits for the queue to drain.
fn drained<T>(app: &AppLocal, f: impl FnOnce(&AppLocal) -> T) -> T {
    app.run_queue();
    let result = f(app);
    app.shutdown();
    app.wait_task_queue_finish();
    result
}

#[test]
fn test_refresh_all_then_recommend() {
    let provider = Arc::new(FakeProvider::default());
    let (app, docs) = create_app(provider.clone());
    seed(&docs);

    let counts = drained(&app, |app| app.refresh_all()).unwrap();
    assert_eq!(
        counts,
        BatchCounts {
            profile_count: 2,
            item_count: 2
        }
    );
    assert_eq!(provider.calls(), 4);
    assert_eq!(app.indexed_counts().unwrap(), (2, 2));

    let results = app.recommend_for_profile("ava", None).unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.matched.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["trail", "gig"]);
    assert!((results[0].matched.score - 1.0).abs() < 1e-6);
    assert_eq!(results[1].matched.score, 0.0);
    assert!(!results[0].stale);
    assert_eq!(results[0].matched.snapshot["title"], json!("Hiking the coast"));

    let results = app.recommend_for_profile("ben", Some(2)).unwrap();
    assert_eq!(results[0].matched.entity_id, "gig");

    let results = app.recommend_for_text("coffee and music", Some(1)).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].matched.entity_id, "gig");
}

#[test]
fn test_provider_failure_keeps_prior_record() {
    let provider = Arc::new(FakeProvider::default());
    let (app, docs) = create_app(provider.clone());
    seed(&docs);

    app.run_queue();
    app.refresh_one(EntityKind::Item, "trail").unwrap();
    app.shutdown();
    app.wait_task_queue_finish();

    let before = docs.get(Collection::ItemEmbeddings, "trail").unwrap().unwrap();

    docs.set(
        Collection::Items,
        "trail",
        doc(json!({"title": "Renamed", "category": "food"})),
    )
    .unwrap();
    provider.set_failing(true);

    drained(&app, |app| app.refresh_one(EntityKind::Item, "trail")).unwrap();

    let after = docs.get(Collection::ItemEmbeddings, "trail").unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(after["snapshot"]["title"], json!("Hiking the coast"));

    let dump = app.task_queue();
    assert!(dump
        .queue
        .iter()
        .any(|td| matches!(&td.status, Status::Error(msg) if msg.contains("connection refused"))));
}

#[test]
fn test_refresh_replaces_snapshot() {
    let provider = Arc::new(FakeProvider::default());
    let (app, docs) = create_app(provider);
    seed(&docs);

    drained(&app, |app| app.refresh_one(EntityKind::Profile, "ben")).unwrap();
    docs.set(
        Collection::Profiles,
        "ben",
        doc(json!({"displayName": "Ben", "location": "Porto"})),
    )
    .unwrap();
    drained(&app, |app| app.refresh_one(EntityKind::Profile, "ben")).unwrap();

    let record = docs.get(Collection::ProfileEmbeddings, "ben").unwrap().unwrap();
    assert_eq!(record["snapshot"], json!({"displayName": "Ben", "location": "Porto"}));
}

#[test]
fn test_missing_embedding_gives_empty_results() {
    let (app, docs) = create_app(Arc::new(FakeProvider::default()));
    seed(&docs);

    assert!(app.recommend_for_profile("ava", None).unwrap().is_empty());
    assert!(app.similar_profiles("ava", None).unwrap().is_empty());
}

#[test]
fn test_refresh_unknown_entity_is_not_found() {
    let (app, _docs) = create_app(Arc::new(FakeProvider::default()));
    let result = drained(&app, |app| app.refresh_one(EntityKind::Profile, "nobody"));
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[test]
fn test_batch_uses_default_limit() {
    let (app, docs) = create_app(Arc::new(FakeProvider::default()));
    for i in 0..60 {
        docs.set(
            Collection::Profiles,
            &format!("u{i:02}"),
            doc(json!({"displayName": "someone", "updatedAt": "2024-05-01"})),
        )
        .unwrap();
    }

    let counts = drained(&app, |app| app.batch_process(None, None)).unwrap();
    assert_eq!(counts.profile_count, 50);
    assert_eq!(counts.item_count, 0);

    let counts = drained(&app, |app| app.batch_process(Some("2030-01-01"), Some(100))).unwrap();
    assert_eq!(counts.profile_count, 0);
}

#[test]
fn test_scheduling_without_queue_fails() {
    let (app, docs) = create_app(Arc::new(FakeProvider::default()));
    seed(&docs);
    assert!(matches!(
        app.refresh_one(EntityKind::Item, "gig"),
        Err(AppError::QueueClosed)
    ));
}
