//! In-memory backend for integration tests
//!
//! Stores rows per table, records every call and can be told to fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use offline_sync::remote::{RemoteBackend, TENANT_FIELD};
use offline_sync::shared::timestamp::{record_id, record_updated_at};
use offline_sync::shared::SyncError;

/// How many calls of a kind should fail, and with what
#[derive(Debug, Clone)]
struct FailurePlan {
    remaining: u32,
    error: SyncError,
}

impl FailurePlan {
    fn take(&mut self) -> Option<SyncError> {
        if self.remaining == 0 {
            return None;
        }
        if self.remaining != u32::MAX {
            self.remaining -= 1;
        }
        Some(self.error.clone())
    }
}

#[derive(Default)]
struct MockState {
    rows: HashMap<String, BTreeMap<String, Value>>,
    calls: Vec<String>,
    write_failures: Option<FailurePlan>,
    fetch_failures: Option<FailurePlan>,
    rpc_failures: Option<FailurePlan>,
    failing_records: HashSet<String>,
    full_scope: HashMap<String, String>,
    fetch_delay: Duration,
}

/// Mock backend
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a backend serving the default full-scope procedure for contacts
    pub fn new() -> Self {
        let backend = Self {
            state: Mutex::new(MockState::default()),
        };
        backend.with_full_scope_rpc("pull_all_contacts", "contacts")
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn with_full_scope_rpc(self, rpc: &str, table: &str) -> Self {
        self.state().full_scope.insert(rpc.to_string(), table.to_string());
        self
    }

    /// Seed remote rows
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut state = self.state();
        let table_rows = state.rows.entry(table.to_string()).or_default();
        for row in rows {
            let id = record_id(&row).expect("seeded row needs an id");
            table_rows.insert(id, row);
        }
    }

    /// Current remote rows of a table, ordered by id
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state()
            .rows
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.state().rows.get(table).and_then(|rows| rows.get(id).cloned())
    }

    /// Fail the next `count` writes (`u32::MAX` fails forever)
    pub fn fail_writes(&self, count: u32, error: SyncError) {
        self.state().write_failures = Some(FailurePlan {
            remaining: count,
            error,
        });
    }

    pub fn fail_fetches(&self, count: u32, error: SyncError) {
        self.state().fetch_failures = Some(FailurePlan {
            remaining: count,
            error,
        });
    }

    pub fn fail_rpcs(&self, count: u32, error: SyncError) {
        self.state().rpc_failures = Some(FailurePlan {
            remaining: count,
            error,
        });
    }

    /// Fail every write touching this record id
    pub fn fail_record(&self, id: &str) {
        self.state().failing_records.insert(id.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.state();
        state.write_failures = None;
        state.fetch_failures = None;
        state.rpc_failures = None;
        state.failing_records.clear();
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = delay;
    }

    /// Every call so far, formatted `method:target[:id]`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls starting with `prefix`
    pub fn call_count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn begin_write(&self, call: String, id: &str) -> Result<(), SyncError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.failing_records.contains(id) {
            return Err(SyncError::network("connection reset by peer"));
        }
        match state.write_failures.as_mut().and_then(FailurePlan::take) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn begin_fetch(&self, call: String) -> Result<(), SyncError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(call);
            if let Some(error) = state.fetch_failures.as_mut().and_then(FailurePlan::take) {
                return Err(error);
            }
            state.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn changes(&self, table: &str, tenant: &str, since: Option<DateTime<Utc>>) -> Vec<Value> {
        let mut rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| row.get(TENANT_FIELD).and_then(Value::as_str).map_or(true, |t| t == tenant))
            .filter(|row| match (since, record_updated_at(row)) {
                (Some(since), Some(ts)) => ts >= since,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        rows.sort_by_key(record_updated_at);
        rows
    }
}

#[async_trait]
impl RemoteBackend for MockBackend {
    async fn fetch_changes(
        &self,
        table: &str,
        tenant: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, SyncError> {
        self.begin_fetch(format!("fetch:{}", table)).await?;
        Ok(self.changes(table, tenant, since))
    }

    async fn fetch_recent(&self, table: &str, tenant: &str, limit: usize) -> Result<Vec<Value>, SyncError> {
        self.begin_fetch(format!("recent:{}", table)).await?;
        let mut rows = self.changes(table, tenant, None);
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count(&self, table: &str, tenant: &str) -> Result<u64, SyncError> {
        self.begin_fetch(format!("count:{}", table)).await?;
        Ok(self.changes(table, tenant, None).len() as u64)
    }

    async fn upsert(&self, table: &str, tenant: &str, record: &Value) -> Result<(), SyncError> {
        let id = record_id(record).unwrap_or_default();
        self.begin_write(format!("upsert:{}:{}", table, id), &id)?;
        let mut row = record.clone();
        row[TENANT_FIELD] = Value::String(tenant.to_string());
        self.insert_rows(table, [row]);
        Ok(())
    }

    async fn update(&self, table: &str, _tenant: &str, id: &str, patch: &Value) -> Result<(), SyncError> {
        self.begin_write(format!("update:{}:{}", table, id), id)?;
        let mut state = self.state();
        if let Some(row) = state.rows.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            if let (Some(row), Some(patch)) = (row.as_object_mut(), patch.as_object()) {
                for (key, value) in patch {
                    row.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, _tenant: &str, id: &str) -> Result<(), SyncError> {
        self.begin_write(format!("delete:{}:{}", table, id), id)?;
        if let Some(rows) = self.state().rows.get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn call_rpc(&self, name: &str, args: &Value) -> Result<Value, SyncError> {
        let table = self.state().full_scope.get(name).cloned();
        if let Some(table) = table {
            self.begin_fetch(format!("rpc:{}", name)).await?;
            let tenant = args["tenant_id"].as_str().unwrap_or_default().to_string();
            let since = args["since"]
                .as_str()
                .and_then(offline_sync::shared::timestamp::normalize_timestamp);
            return Ok(Value::Array(self.changes(&table, &tenant, since)));
        }

        let mut state = self.state();
        state.calls.push(format!("rpc:{}", name));
        match state.rpc_failures.as_mut().and_then(FailurePlan::take) {
            Some(error) => Err(error),
            None => Ok(Value::Null),
        }
    }

    async fn ping(&self) -> Result<(), SyncError> {
        Ok(())
    }
}
