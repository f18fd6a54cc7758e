//! Pull engine tests: conflict resolution, pending-change protection,
//! checkpoints and fast import

use serde_json::{json, Value};
use std::sync::Arc;

use offline_sync::local_db::{LocalDatabase, LocalStore, RecordSyncStatus, SettingsStore};
use offline_sync::offline::{stamp_payload, OperationKind, SyncOperation};
use offline_sync::shared::{SyncConfigBuilder, SyncEvent, TablePolicy};
use offline_sync::sync::{CheckpointStore, ConflictStrategy, PullOptions, PullStatus, SyncEngine};

use crate::common::*;

fn notes_config() -> SyncConfigBuilder {
    test_config()
        .staleness_threshold_secs(300)
        .table(
            TablePolicy::new("notes")
                .with_required_fields(&["title"])
                .with_user_fields(&["memo"]),
        )
}

fn note(id: &str, title: &str, updated_at: &str) -> Value {
    json!({"id": id, "title": title, "tenant_id": TENANT, "updated_at": updated_at})
}

async fn notes_engine(config: SyncConfigBuilder, remote: Vec<Value>) -> TestEngine {
    let backend = Arc::new(MockBackend::new());
    backend.insert_rows("notes", remote);
    engine_with(config.build().unwrap(), backend).await
}

#[tokio::test]
async fn test_newer_remote_version_wins() {
    let t = notes_engine(notes_config(), vec![note("n1", "remote", &at(10))]).await;
    seed_local(&t.db, "notes", note("n1", "local", &at(0)), RecordSyncStatus::Synced).await;

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.status, PullStatus::Completed);
    assert_eq!(outcome.stats.applied, 1);

    let record = local(&t.db, "notes", "n1").await;
    assert_eq!(record.data["title"], "remote");
    assert!(record.is_synced());
    assert_eq!(record.version, 2);
}

#[tokio::test]
async fn test_newer_local_version_is_kept() {
    let t = notes_engine(notes_config(), vec![note("n1", "remote", &at(0))]).await;
    seed_local(&t.db, "notes", note("n1", "local", &at(10)), RecordSyncStatus::Synced).await;

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.stats.kept_local, 1);
    assert_eq!(local(&t.db, "notes", "n1").await.data["title"], "local");
}

#[tokio::test]
async fn test_pending_change_is_protected_until_stale() {
    let t = notes_engine(notes_config(), vec![note("n1", "remote", &at(4))]).await;
    seed_local(&t.db, "notes", note("n1", "draft", &at(0)), RecordSyncStatus::Pending).await;

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.stats.protected, 1);
    let record = local(&t.db, "notes", "n1").await;
    assert_eq!(record.data["title"], "draft");
    assert_eq!(record.sync_status, RecordSyncStatus::Pending);

    let t = notes_engine(notes_config(), vec![note("n1", "remote", &at(6))]).await;
    seed_local(&t.db, "notes", note("n1", "draft", &at(0)), RecordSyncStatus::Pending).await;

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.stats.applied, 1);
    let record = local(&t.db, "notes", "n1").await;
    assert_eq!(record.data["title"], "remote");
    assert!(record.is_synced());
}

#[tokio::test]
async fn test_checkpoint_advances_and_limits_refetching() {
    let remote: Vec<Value> = (0..3).map(|i| note(&format!("n{}", i), "x", &at(i))).collect();
    let t = notes_engine(notes_config(), remote).await;

    let first = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(first.fetched, 3);
    assert_eq!(first.stats.inserted, 3);
    let first_checkpoint = first.checkpoint.unwrap();

    let second = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(second.fetched, 0);
    assert!(second.checkpoint.unwrap() >= first_checkpoint);

    let later = offline_sync::shared::timestamp::to_canonical(
        &(chrono::Utc::now() + chrono::Duration::minutes(1)),
    );
    t.backend.insert_rows("notes", [note("n9", "late", &later)]);
    let third = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(third.fetched, 1);

    // Forced pulls ignore the checkpoint
    let forced = crate::assert_ok!(
        t.engine
            .pull_table("notes", PullOptions { force: true, ..Default::default() })
            .await
    );
    assert_eq!(forced.fetched, 4);
    assert_eq!(forced.stats.unchanged, 4);
}

#[tokio::test]
async fn test_limited_pull_never_moves_checkpoint() {
    let remote: Vec<Value> = (0..5).map(|i| note(&format!("n{}", i), "x", &at(i))).collect();
    let t = notes_engine(notes_config(), remote).await;

    let outcome = crate::assert_ok!(
        t.engine
            .pull_table("notes", PullOptions { limit: Some(2), ..Default::default() })
            .await
    );
    assert_eq!(outcome.fetched, 2);
    assert!(outcome.checkpoint.is_none());
    assert_eq!(t.backend.call_count("recent:notes"), 1);

    // Most recent rows first
    assert!(t.db.get("notes", "n4").await.unwrap().is_some());
    assert!(t.db.get("notes", "n0").await.unwrap().is_none());

    let full = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(full.fetched, 5);
}

#[tokio::test]
async fn test_checkpoint_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");

    {
        let db = Arc::new(LocalDatabase::open(&path).await.unwrap());
        let backend = Arc::new(MockBackend::new());
        backend.insert_rows("notes", [note("n1", "x", &at(0))]);
        let engine = SyncEngine::new(notes_config().build().unwrap(), db, backend).unwrap();
        crate::assert_ok!(engine.pull_table("notes", PullOptions::default()).await);
        engine.destroy();
    }

    let db: Arc<dyn SettingsStore> = Arc::new(LocalDatabase::open(&path).await.unwrap());
    let checkpoints = CheckpointStore::new(db);
    assert!(checkpoints.get("notes").await.unwrap().is_some());
    assert!(checkpoints.get("groups").await.unwrap().is_none());
}

#[tokio::test]
async fn test_manual_strategy_flags_record() {
    let config = notes_config().conflict_strategy(ConflictStrategy::Manual);
    let t = notes_engine(config, vec![note("n1", "remote", &at(5))]).await;
    seed_local(&t.db, "notes", note("n1", "local", &at(0)), RecordSyncStatus::Synced).await;
    let mut rx = t.engine.subscribe();

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.stats.manual, 1);

    let record = local(&t.db, "notes", "n1").await;
    assert_eq!(record.sync_status, RecordSyncStatus::Conflict);
    assert_eq!(record.data["title"], "local");

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::ConflictDetected { resolution, .. } if resolution == "manual_pending"
    )));
    crate::assert_event!(events, SyncEvent::UserNotification { .. });
}

#[tokio::test]
async fn test_timestamp_tie_merges_user_fields() {
    let mut remote = note("n1", "remote title", &at(0));
    remote["memo"] = json!("remote memo");
    let t = notes_engine(notes_config(), vec![remote]).await;

    let mut ours = note("n1", "local title", &at(0));
    ours["memo"] = json!("local memo");
    seed_local(&t.db, "notes", ours, RecordSyncStatus::Synced).await;
    let mut rx = t.engine.subscribe();

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.stats.merged, 1);

    let record = local(&t.db, "notes", "n1").await;
    assert_eq!(record.data["title"], "remote title");
    assert_eq!(record.data["memo"], "local memo");
    assert!(drain_events(&mut rx).iter().any(|e| matches!(
        e,
        SyncEvent::ConflictDetected { resolution, .. } if resolution == "merged"
    )));
}

#[tokio::test]
async fn test_invalid_remote_records_are_skipped() {
    let t = notes_engine(
        notes_config(),
        vec![
            note("n1", "fine", &at(0)),
            json!({"id": "n2", "tenant_id": TENANT, "updated_at": at(1)}),
        ],
    )
    .await;

    let outcome = crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    assert_eq!(outcome.fetched, 2);
    assert_eq!(outcome.stats.inserted, 1);
    assert_eq!(outcome.stats.invalid, 1);
    assert!(t.db.get("notes", "n2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_fast_import_into_empty_table() {
    let backend = Arc::new(MockBackend::new());
    backend.insert_rows("contacts", contacts(7));
    let config = test_config().pull_chunk_size(3).build().unwrap();
    let t = engine_with(config, backend).await;

    let outcome = crate::assert_ok!(
        t.engine
            .pull_table("contacts", PullOptions { fast_import: true, ..Default::default() })
            .await
    );
    assert_eq!(outcome.stats.inserted, 7);
    assert_eq!(t.backend.call_count("rpc:pull_all_contacts"), 1);
    assert!(local(&t.db, "contacts", "c006").await.is_synced());
}

#[tokio::test]
async fn test_remote_tombstone_marks_local_deleted() {
    let mut tombstone = note("n1", "gone", &at(1));
    tombstone["deleted"] = json!(true);
    let t = notes_engine(notes_config(), vec![tombstone]).await;
    seed_local(&t.db, "notes", note("n1", "here", &at(0)), RecordSyncStatus::Synced).await;

    crate::assert_ok!(t.engine.pull_table("notes", PullOptions::default()).await);
    let record = local(&t.db, "notes", "n1").await;
    assert!(record.deleted);
}

#[tokio::test]
async fn test_unknown_table_is_rejected() {
    let t = default_engine().await;
    crate::assert_err!(
        t.engine.pull_table("invoices", PullOptions::default()).await,
        offline_sync::shared::SyncError::Validation { .. }
    );
}

#[tokio::test]
async fn test_background_processing_finishes_later() {
    let remote: Vec<Value> = (0..4).map(|i| note(&format!("n{}", i), "x", &at(i))).collect();
    let t = notes_engine(notes_config().pull_chunk_size(1), remote).await;

    let outcome = crate::assert_ok!(
        t.engine
            .pull_table(
                "notes",
                PullOptions {
                    background_processing: true,
                    ..Default::default()
                }
            )
            .await
    );
    assert_eq!(outcome.status, PullStatus::Backgrounded);
    assert_eq!(outcome.fetched, 4);

    t.engine.wait_for_background().await;
    assert!(local(&t.db, "notes", "n3").await.is_synced());
    let db: Arc<dyn SettingsStore> = t.db.clone();
    assert!(CheckpointStore::new(db).get("notes").await.unwrap().is_some());
}

#[tokio::test]
async fn test_local_edit_during_merge_is_not_overwritten() {
    let db = Arc::new(LocalDatabase::in_memory().await.unwrap());
    let store = Arc::new(InterleavingStore::new(db.clone()));
    let backend = Arc::new(MockBackend::new());
    backend.insert_rows("notes", [note("n1", "remote", &at(10))]);
    seed_local(&db, "notes", note("n1", "local", &at(0)), RecordSyncStatus::Synced).await;
    let engine = engine_over(notes_config().build().unwrap(), store.clone(), db.clone(), backend);

    let patch = stamp_payload(
        OperationKind::Update,
        "n1",
        json!({"title": "edited"}),
        chrono::Utc::now(),
    );
    store.edit_after_next_read(SyncOperation::new("notes", OperationKind::Update, "n1", patch, None));

    let outcome = crate::assert_ok!(engine.pull_table("notes", PullOptions::default()).await);
    assert!(store.edit_landed());
    assert_eq!(outcome.stats.protected, 1);
    assert_eq!(outcome.stats.applied, 0);

    let record = local(&db, "notes", "n1").await;
    assert_eq!(record.data["title"], "edited");
    assert_eq!(record.sync_status, RecordSyncStatus::Pending);
}
