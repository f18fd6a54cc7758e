//! Test fixtures
//!
//! Engines over in-memory SQLite, fast retry settings and record builders.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use offline_sync::local_db::{LocalDatabase, LocalStore, Record, RecordSyncStatus};
use offline_sync::offline::RetryPolicy;
use offline_sync::shared::{SyncConfig, SyncConfigBuilder};
use offline_sync::sync::SyncEngine;

use super::mock_backend::MockBackend;

pub const TENANT: &str = "tenant-1";

/// A base timestamp all fixtures are relative to
pub const T0: &str = "2024-05-01T10:00:00.000Z";

/// `T0` plus `minutes`, in canonical form
pub fn at(minutes: i64) -> String {
    let base = offline_sync::shared::timestamp::normalize_timestamp(T0).unwrap();
    offline_sync::shared::timestamp::to_canonical(&(base + chrono::Duration::minutes(minutes)))
}

/// Configuration with manual cycles and millisecond backoff
pub fn test_config() -> SyncConfigBuilder {
    SyncConfig::builder()
        .tenant_id(TENANT)
        .auto_sync(false)
        .retry(RetryPolicy::new(3, 1, 2.0, 50))
        .cycle_backoff_base_secs(3600)
}

pub struct TestEngine {
    pub engine: SyncEngine,
    pub db: Arc<LocalDatabase>,
    pub backend: Arc<MockBackend>,
}

/// Engine over a fresh in-memory database
pub async fn engine_with(config: SyncConfig, backend: Arc<MockBackend>) -> TestEngine {
    let db = Arc::new(LocalDatabase::in_memory().await.unwrap());
    let engine = SyncEngine::new(config, db.clone(), backend.clone()).unwrap();
    TestEngine {
        engine,
        db,
        backend,
    }
}

/// Engine whose records go through `store`; the queue and checkpoints stay on `db`
pub fn engine_over(
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    db: Arc<LocalDatabase>,
    backend: Arc<MockBackend>,
) -> SyncEngine {
    SyncEngine::with_stores(config, store, db.clone(), db, backend).unwrap()
}

pub async fn default_engine() -> TestEngine {
    engine_with(test_config().build().unwrap(), Arc::new(MockBackend::new())).await
}

pub fn contact(id: &str, phone: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "phone": phone,
        "name": format!("Contact {}", id),
        "tenant_id": TENANT,
        "updated_at": updated_at,
    })
}

/// `count` contacts one minute apart
pub fn contacts(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| contact(&format!("c{:03}", i), &format!("+1555{:04}", i), &at(i as i64)))
        .collect()
}

/// Store a record locally with the given sync status
pub async fn seed_local(db: &LocalDatabase, table: &str, data: Value, status: RecordSyncStatus) {
    let id = offline_sync::shared::timestamp::record_id(&data).unwrap();
    let mut record = Record::from_remote(id, data);
    record.sync_status = status;
    db.put(table, &record).await.unwrap();
}

pub async fn local(db: &LocalDatabase, table: &str, id: &str) -> Record {
    db.get(table, id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{}/{} not stored locally", table, id))
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
