//! Integration tests for the PostgreSQL state store.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_state_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::sync::Arc;

use chrono::{Duration, Utc};
use sluice::state::postgres::PostgresStateStoreConfig;
use sluice::state::PostgresStateStore;
use sluice::*;
use sluice_testkit::{source_of, work_items, MockExtensions, MockProcessor, RecordingReporter};
use uuid::Uuid;

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set")
}

/// A store in its own scope so parallel tests never see each other's keys.
async fn scoped_store() -> Arc<dyn StateStore> {
    let descriptor = ExtensionDescriptor::new(
        "postgres",
        ExtensionKind::StateStore,
        serde_json::json!({
            "connection_string": database_url(),
            "scope": format!("test-{}", Uuid::new_v4()),
        }),
    );
    create_state_store(&descriptor).await.expect("connect state store")
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn put_get_delete_round_trip() {
    let store = scoped_store().await;

    store.put("fetcher:fs", b"one".to_vec()).await.unwrap();
    store.put("fetcher:fs", b"two".to_vec()).await.unwrap();
    assert_eq!(store.get("fetcher:fs").await.unwrap(), Some(b"two".to_vec()));
    assert!(store.contains_key("fetcher:fs").await.unwrap());

    let keys = store.list_keys().await.unwrap();
    assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["fetcher:fs".to_string()]);

    assert!(store.delete("fetcher:fs").await.unwrap());
    assert!(!store.delete("fetcher:fs").await.unwrap());
    assert_eq!(store.get("fetcher:fs").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn access_time_never_moves_backwards() {
    let store = scoped_store().await;
    store.put("emitter:out", b"{}".to_vec()).await.unwrap();

    let later = Utc::now() + Duration::hours(1);
    store.update_access_time("emitter:out", later).await.unwrap();
    store
        .update_access_time("emitter:out", later - Duration::hours(2))
        .await
        .unwrap();

    let recorded = store.get_access_time("emitter:out").await.unwrap().unwrap();
    assert!((recorded - later).num_milliseconds().abs() < 1);

    store.put("emitter:out", b"{}".to_vec()).await.unwrap();
    assert_eq!(store.get_access_time("emitter:out").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn scopes_are_isolated() {
    let config = PostgresStateStoreConfig {
        connection_string: database_url(),
        max_connections: 2,
        acquire_timeout_seconds: 10,
        scope: format!("test-{}", Uuid::new_v4()),
    };
    let first = PostgresStateStore::connect(&config).await.unwrap();
    first.initialize().await.unwrap();
    let second = PostgresStateStore::new(first.pool().clone(), format!("test-{}", Uuid::new_v4()));

    first.put("job:a", b"x".to_vec()).await.unwrap();
    assert_eq!(second.get("job:a").await.unwrap(), None);
    assert!(second.list_keys().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn job_status_is_shared_through_postgres() {
    let store = scoped_store().await;
    let extensions = MockExtensions::install(Arc::clone(&store)).await.unwrap();
    let supervisor = SupervisorBuilder::new(PipesConfig::default().with_num_workers(2))
        .with_registry(Arc::clone(&extensions.registry))
        .with_processor(Arc::new(MockProcessor::new()))
        .with_reporter(Arc::new(RecordingReporter::new()))
        .build()
        .unwrap();

    let job_id = JobId::new();
    let summary = supervisor
        .run(JobRequest::new(source_of(work_items(5))).with_job_id(job_id))
        .await
        .unwrap();
    assert_eq!(summary.count(OutcomeStatus::Success), 5);

    // A tracker on a separate registry over the same scope sees the result.
    let tracker = JobStatusTracker::new(Arc::clone(&store), StoreRetryConfig::default());
    let status = tracker.get(job_id).await.unwrap().expect("status stored");
    assert_eq!(status.state(), JobState::Completed);
    assert_eq!(status.items_reported, 5);
}
