//! Orchestrator tests: cycle sharing, status transitions, events and
//! connectivity handling

use futures_util::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use offline_sync::local_db::{LocalStore, RecordSyncStatus};
use offline_sync::offline::OperationKind;
use offline_sync::shared::{SyncError, SyncEvent};
use offline_sync::sync::EngineStatus;

use crate::common::*;

#[tokio::test]
async fn test_concurrent_triggers_run_one_cycle() {
    let t = default_engine().await;
    t.backend.set_fetch_delay(Duration::from_millis(50));

    let results = join_all((0..10).map(|_| t.engine.trigger_sync())).await;
    for result in &results {
        crate::assert_ok!(result.as_ref());
    }

    assert_eq!(t.backend.call_count("rpc:pull_all_contacts"), 1);
    assert_eq!(t.backend.call_count("fetch:groups"), 1);
    let stats = t.engine.get_sync_stats().await.unwrap();
    assert_eq!(stats.metrics.total_syncs, 1);
    assert_eq!(stats.metrics.successful_syncs, 1);

    // A finished cycle is not reused
    crate::assert_ok!(t.engine.trigger_sync().await);
    assert_eq!(t.backend.call_count("rpc:pull_all_contacts"), 2);
}

#[tokio::test]
async fn test_cycle_events_in_order() {
    let t = default_engine().await;
    let mut rx = t.engine.subscribe();

    t.engine
        .enqueue("groups", OperationKind::Create, "g1", json!({"name": "Friends"}), None)
        .await
        .unwrap();
    crate::assert_ok!(t.engine.trigger_sync().await);

    let events = drain_events(&mut rx);
    let syncing = position(&events, |e| {
        matches!(e, SyncEvent::StatusChange { status: EngineStatus::Syncing })
    })
    .unwrap();
    let start = position(&events, |e| matches!(e, SyncEvent::SyncStart)).unwrap();
    let complete = position(&events, |e| matches!(e, SyncEvent::SyncComplete { .. })).unwrap();
    let idle = position(&events, |e| {
        matches!(e, SyncEvent::StatusChange { status: EngineStatus::Idle })
    })
    .unwrap();

    assert!(syncing < start);
    assert!(start < complete);
    assert!(idle < complete);
    crate::assert_event!(events, SyncEvent::ProgressUpdate { .. });
    crate::assert_event!(events, SyncEvent::SyncComplete { pushed: 1, failed: 0, .. });
}

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() {
    let t = default_engine().await;
    let delivered = Arc::new(AtomicUsize::new(0));

    t.engine.add_event_listener(|_| panic!("listener failure"));
    let counter = delivered.clone();
    let id = t.engine.add_event_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    crate::assert_ok!(t.engine.trigger_sync().await);
    let seen = delivered.load(Ordering::SeqCst);
    assert!(seen >= 3, "only {} events delivered", seen);

    assert!(t.engine.remove_event_listener(id));
    crate::assert_ok!(t.engine.trigger_sync().await);
    assert_eq!(delivered.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn test_failed_cycles_reconnect_then_give_up() {
    let config = test_config().max_cycle_failures(2).build().unwrap();
    let t = engine_with(config, Arc::new(MockBackend::new())).await;
    let mut rx = t.engine.subscribe();
    t.backend
        .fail_fetches(u32::MAX, SyncError::network("connection refused"));

    crate::assert_err!(t.engine.trigger_sync().await, SyncError::Network { .. });
    let status = t.engine.get_status().await.unwrap();
    assert_eq!(status.status, EngineStatus::Reconnecting);
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_error.is_some());
    crate::assert_event!(drain_events(&mut rx), SyncEvent::SyncError { .. });

    crate::assert_err!(t.engine.trigger_sync().await);
    assert_eq!(t.engine.get_status().await.unwrap().status, EngineStatus::Error);

    // An explicit trigger recovers from the error state
    t.backend.heal();
    crate::assert_ok!(t.engine.trigger_sync().await);
    let status = t.engine.get_status().await.unwrap();
    assert_eq!(status.status, EngineStatus::Idle);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_sync.is_some());
}

#[tokio::test]
async fn test_unauthorized_is_an_immediate_error() {
    let t = default_engine().await;
    t.backend.fail_fetches(
        u32::MAX,
        SyncError::Unauthorized {
            message: "JWT expired".into(),
        },
    );

    crate::assert_err!(t.engine.trigger_sync().await, SyncError::Unauthorized { .. });
    assert_eq!(t.engine.get_status().await.unwrap().status, EngineStatus::Error);
}

#[tokio::test]
async fn test_offline_writes_are_kept_for_later() {
    let t = default_engine().await;
    t.engine.set_online(false).await.unwrap();

    crate::assert_err!(t.engine.trigger_sync().await, SyncError::Offline);
    assert_eq!(t.engine.get_status().await.unwrap().status, EngineStatus::Offline);

    t.engine
        .enqueue("contacts", OperationKind::Create, "c1", json!({"phone": "+1555"}), None)
        .await
        .unwrap();
    let record = local(&t.db, "contacts", "c1").await;
    assert_eq!(record.sync_status, RecordSyncStatus::Pending);
    assert!(t.backend.calls().iter().all(|c| !c.starts_with("upsert")));

    t.engine.set_online(true).await.unwrap();
    crate::assert_ok!(t.engine.trigger_sync().await);
    assert!(t.backend.row("contacts", "c1").is_some());
    assert!(local(&t.db, "contacts", "c1").await.is_synced());
}

#[tokio::test]
async fn test_reconnect_triggers_sync_with_auto_sync() {
    let config = test_config()
        .auto_sync(true)
        .sync_interval_secs(3600)
        .background_interval_secs(3600)
        .build()
        .unwrap();
    let t = engine_with(config, Arc::new(MockBackend::new())).await;
    t.engine.start().unwrap();

    let engine = t.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move { engine.get_sync_stats().await.unwrap().metrics.successful_syncs >= 1 }
        })
        .await
    );

    t.engine.set_online(false).await.unwrap();
    t.engine
        .enqueue("groups", OperationKind::Create, "g1", json!({"name": "Team"}), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.engine.get_status().await.unwrap().pending_operations, 1);

    t.engine.set_online(true).await.unwrap();
    let engine = t.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move { engine.get_status().await.unwrap().pending_operations == 0 }
        })
        .await
    );
    assert!(t.backend.row("groups", "g1").is_some());
    t.engine.destroy();
}

#[tokio::test]
async fn test_critical_operations_trigger_one_debounced_cycle() {
    let config = test_config()
        .auto_sync(true)
        .sync_interval_secs(3600)
        .background_interval_secs(3600)
        .critical_debounce_ms(100)
        .build()
        .unwrap();
    let t = engine_with(config, Arc::new(MockBackend::new())).await;
    t.engine.start().unwrap();

    let engine = t.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move { engine.get_sync_stats().await.unwrap().metrics.successful_syncs == 1 }
        })
        .await
    );

    for i in 0..3 {
        t.engine
            .enqueue("quotas", OperationKind::Update, &format!("q{}", i), json!({"used": i}), None)
            .await
            .unwrap();
    }

    let engine = t.engine.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let engine = engine.clone();
            async move { engine.get_status().await.unwrap().pending_operations == 0 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.engine.get_sync_stats().await.unwrap().metrics.total_syncs, 2);
    assert_eq!(t.backend.call_count("rpc:commit_quota_reservation"), 3);
    t.engine.destroy();
}

#[tokio::test]
async fn test_destroy_rejects_further_calls() {
    let t = default_engine().await;
    t.engine.destroy();

    crate::assert_err!(t.engine.trigger_sync().await, SyncError::Destroyed);
    crate::assert_err!(
        t.engine
            .enqueue("groups", OperationKind::Create, "g1", json!({"name": "x"}), None)
            .await,
        SyncError::Destroyed
    );
    crate::assert_err!(t.engine.background_sync(vec!["groups".into()]), SyncError::Destroyed);
}

#[tokio::test]
async fn test_reset_metrics() {
    let t = default_engine().await;
    crate::assert_ok!(t.engine.trigger_sync().await);
    assert_eq!(t.engine.get_sync_stats().await.unwrap().metrics.total_syncs, 1);

    t.engine.reset_metrics().await;
    let metrics = t.engine.get_sync_stats().await.unwrap().metrics;
    assert_eq!(metrics.total_syncs, 0);
    assert_eq!(metrics.successful_syncs, 0);
}

#[tokio::test]
async fn test_status_counts_down_to_next_sync() {
    let t = default_engine().await;
    assert_eq!(t.engine.get_status().await.unwrap().next_sync_in, None);

    crate::assert_ok!(t.engine.trigger_sync().await);
    let status = t.engine.get_status().await.unwrap();
    let next = status.next_sync_in.unwrap();
    assert!(next <= status.current_interval);
    assert!(next > Duration::ZERO);
}

#[tokio::test]
async fn test_purge_tombstones_keeps_unpushed_deletions() {
    let config = test_config().tombstone_retention_secs(0).build().unwrap();
    let t = engine_with(config, Arc::new(MockBackend::new())).await;
    seed_local(
        &t.db,
        "groups",
        json!({"id": "gone", "name": "a", "deleted": true}),
        RecordSyncStatus::Synced,
    )
    .await;
    seed_local(
        &t.db,
        "groups",
        json!({"id": "unpushed", "name": "b", "deleted": true}),
        RecordSyncStatus::Pending,
    )
    .await;
    seed_local(&t.db, "groups", json!({"id": "live", "name": "c"}), RecordSyncStatus::Synced).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(crate::assert_ok!(t.engine.purge_tombstones().await), 1);
    assert!(t.db.get("groups", "gone").await.unwrap().is_none());
    assert!(local(&t.db, "groups", "unpushed").await.deleted);
    assert!(!local(&t.db, "groups", "live").await.deleted);

    t.engine.destroy();
    crate::assert_err!(t.engine.purge_tombstones().await, SyncError::Destroyed);
}
