//! # Pull Engine
//!
//! Fetches remote changes per table and merges them into the local store.
//!
//! ## Phases
//!
//! 1. **Fetch** (always awaited): every record of the tenant changed since the
//!    table checkpoint. Tables with a full-scope procedure are fetched through
//!    it so row caps do not truncate them.
//! 2. **Process**: records are applied in fetch order, in fixed-size chunks.
//!    Pending local changes are protected unless they are stale; everything
//!    else goes through conflict resolution.
//! 3. **Checkpoint**: advanced to the fetch start time once the whole batch
//!    is applied. Limited fetches never advance it.
//!
//! With `background_processing` the process phase runs on its own task and
//! the call returns right after the fetch. With `fast_import` an empty table
//! is bulk-inserted without conflict checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::local_db::{LocalStore, Record, RecordQuery, RecordSyncStatus};
use crate::offline::optimistic::MAX_WRITE_ATTEMPTS;
use crate::remote::RemoteBackend;
use crate::shared::config::{SyncConfig, TablePolicy};
use crate::shared::error::SyncError;
use crate::shared::event::{EventBus, Severity, SyncEvent};
use crate::shared::timestamp::{record_id, record_updated_at, to_canonical, validate_record};
use crate::sync::checkpoint::CheckpointStore;
use crate::sync::conflict_resolver::{resolve, ConflictState};

/// Options of a single table pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Return after the fetch and apply records on a background task
    pub background_processing: bool,
    /// Bulk-insert without conflict checks when the local table is empty
    pub fast_import: bool,
    /// Ignore the checkpoint and fetch everything
    pub force: bool,
    /// Fetch only the N most recently updated records; never advances the checkpoint
    pub limit: Option<usize>,
    /// Wait for a concurrent pull of the same table instead of skipping
    pub wait_for_lock: bool,
}

/// How a pull call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    Completed,
    /// Fetched; records are still being applied in the background
    Backgrounded,
    /// Another pull of the same table was in progress
    Skipped,
}

/// Per-record result of the process phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Applied,
    Merged,
    Unchanged,
    /// A pending local change was kept
    Protected,
    KeptLocal,
    /// Flagged for manual resolution
    Manual,
    Invalid,
}

/// Counters of one process phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub inserted: usize,
    pub applied: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub protected: usize,
    pub kept_local: usize,
    pub manual: usize,
    pub invalid: usize,
}

impl ApplyStats {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::Applied => self.applied += 1,
            RecordOutcome::Merged => self.merged += 1,
            RecordOutcome::Unchanged => self.unchanged += 1,
            RecordOutcome::Protected => self.protected += 1,
            RecordOutcome::KeptLocal => self.kept_local += 1,
            RecordOutcome::Manual => self.manual += 1,
            RecordOutcome::Invalid => self.invalid += 1,
        }
    }

    /// Records written to the local store
    pub fn written(&self) -> usize {
        self.inserted + self.applied + self.merged
    }

    /// Resolutions that involved a real conflict
    pub fn conflicts(&self) -> usize {
        self.merged + self.manual + self.kept_local
    }
}

/// Result of pulling one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullOutcome {
    pub table: String,
    pub status: PullStatus,
    /// Records returned by the fetch phase
    pub fetched: usize,
    pub stats: ApplyStats,
    /// Checkpoint after the pull, when it was advanced
    pub checkpoint: Option<DateTime<Utc>>,
}

impl PullOutcome {
    fn skipped(table: &str) -> Self {
        Self {
            table: table.to_string(),
            status: PullStatus::Skipped,
            fetched: 0,
            stats: ApplyStats::default(),
            checkpoint: None,
        }
    }
}

/// Per-table in-progress flags
#[derive(Debug, Default)]
struct TableLocks {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

/// Releases a table when dropped
#[derive(Debug)]
pub struct TableGuard {
    locks: Arc<TableLocks>,
    table: String,
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.table);
        self.locks.released.notify_waiters();
    }
}

fn try_lock_table(locks: &Arc<TableLocks>, table: &str) -> Option<TableGuard> {
    let mut held = locks
        .held
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !held.insert(table.to_string()) {
        return None;
    }
    Some(TableGuard {
        locks: Arc::clone(locks),
        table: table.to_string(),
    })
}

async fn lock_table(locks: &Arc<TableLocks>, table: &str) -> TableGuard {
    loop {
        let released = locks.released.notified();
        tokio::pin!(released);
        released.as_mut().enable();
        if let Some(guard) = try_lock_table(locks, table) {
            return guard;
        }
        released.await;
    }
}

/// Everything a pull needs, passed explicitly
pub struct PullContext {
    pub store: Arc<dyn LocalStore>,
    pub backend: Arc<dyn RemoteBackend>,
    pub checkpoints: CheckpointStore,
    pub events: EventBus,
    pub config: Arc<SyncConfig>,
}

/// The pull engine. Cheap to clone.
#[derive(Clone)]
pub struct PullEngine {
    ctx: Arc<PullContext>,
    locks: Arc<TableLocks>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for PullEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullEngine")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl PullEngine {
    /// Create a new pull engine
    pub fn new(ctx: PullContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            locks: Arc::new(TableLocks::default()),
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn context(&self) -> &PullContext {
        &self.ctx
    }

    /// Whether a pull of `table` is in progress
    pub fn is_pulling(&self, table: &str) -> bool {
        self.locks
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(table)
    }

    /// Pull one table
    pub async fn pull_table(&self, table: &str, options: PullOptions) -> Result<PullOutcome, SyncError> {
        let policy = self
            .ctx
            .config
            .table(table)
            .cloned()
            .ok_or_else(|| SyncError::validation(table, "<table>", "table is not syncable"))?;

        let guard = if options.wait_for_lock {
            lock_table(&self.locks, table).await
        } else {
            match try_lock_table(&self.locks, table) {
                Some(guard) => guard,
                None => {
                    tracing::debug!("[Pull] {} is already being pulled, skipping", table);
                    return Ok(PullOutcome::skipped(table));
                }
            }
        };

        let limited = options.limit.is_some();
        let since = if options.force || limited {
            None
        } else {
            self.ctx.checkpoints.get(table).await?
        };

        let fetch_started = Utc::now();
        let records = self.fetch(&policy, since, options.limit).await?;
        let fetched = records.len();
        tracing::info!(
            "[Pull] Fetched {} records for {} (since {})",
            fetched,
            table,
            since.as_ref().map(to_canonical).unwrap_or_else(|| "beginning".into())
        );

        let fast = options.fast_import && !limited && self.can_fast_import(table).await?;

        if options.background_processing {
            let engine = self.clone();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                let table = policy.name.clone();
                match engine.process(&policy, records, fast).await {
                    Ok(stats) => {
                        if !limited {
                            if let Err(e) = engine.ctx.checkpoints.advance(&table, fetch_started).await {
                                tracing::error!("[Pull] Failed to advance checkpoint for {}: {}", table, e);
                            }
                        }
                        tracing::info!(
                            "[Pull] Background processing of {} finished: {} written",
                            table,
                            stats.written()
                        );
                    }
                    Err(e) => tracing::error!("[Pull] Background processing of {} failed: {}", table, e),
                }
            });
            self.track(handle);

            return Ok(PullOutcome {
                table: table.to_string(),
                status: PullStatus::Backgrounded,
                fetched,
                stats: ApplyStats::default(),
                checkpoint: None,
            });
        }

        let stats = self.process(&policy, records, fast).await?;
        let checkpoint = if limited {
            None
        } else {
            Some(self.ctx.checkpoints.advance(table, fetch_started).await?)
        };
        drop(guard);

        Ok(PullOutcome {
            table: table.to_string(),
            status: PullStatus::Completed,
            fetched,
            stats,
            checkpoint,
        })
    }

    async fn can_fast_import(&self, table: &str) -> Result<bool, SyncError> {
        let existing = self.ctx.store.count(table, &RecordQuery::all()).await?;
        if existing > 0 {
            tracing::warn!(
                "[Pull] Fast import requested for {} but it holds {} records, using the checked path",
                table,
                existing
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn fetch(
        &self,
        policy: &TablePolicy,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, SyncError> {
        let tenant = self.ctx.config.tenant_id.as_str();
        let backend = &self.ctx.backend;

        if let Some(limit) = limit {
            return backend.fetch_recent(&policy.name, tenant, limit).await;
        }

        if let Some(rpc) = &policy.full_scope_rpc {
            let args = json!({
                "tenant_id": tenant,
                "since": since.as_ref().map(to_canonical),
            });
            return match backend.call_rpc(rpc, &args).await? {
                Value::Array(rows) => Ok(rows),
                Value::Null => Ok(Vec::new()),
                other => Err(SyncError::Backend {
                    status: 0,
                    message: format!("{} returned {} instead of rows", rpc, type_name(&other)),
                }),
            };
        }

        backend.fetch_changes(&policy.name, tenant, since).await
    }

    /// Apply fetched records in chunks
    async fn process(
        &self,
        policy: &TablePolicy,
        records: Vec<Value>,
        fast: bool,
    ) -> Result<ApplyStats, SyncError> {
        let total = records.len();
        let chunk_size = self.ctx.config.pull_chunk_size.max(1);
        let mut stats = ApplyStats::default();
        let mut done = 0;

        for chunk in records.chunks(chunk_size) {
            if fast {
                self.import_chunk(policy, chunk, &mut stats).await?;
            } else {
                for remote in chunk {
                    let outcome = self.apply_remote(policy, remote).await?;
                    stats.record(outcome);
                }
            }
            done += chunk.len();
            self.ctx.events.emit(SyncEvent::ProgressUpdate {
                current: done,
                total,
            });
            tokio::task::yield_now().await;
        }

        tracing::debug!("[Pull] Processed {}: {:?}", policy.name, stats);
        Ok(stats)
    }

    async fn import_chunk(
        &self,
        policy: &TablePolicy,
        chunk: &[Value],
        stats: &mut ApplyStats,
    ) -> Result<(), SyncError> {
        let mut batch = Vec::with_capacity(chunk.len());
        for remote in chunk {
            match valid_id(policy, remote) {
                Some(id) => batch.push(Record::from_remote(id, remote.clone())),
                None => stats.record(RecordOutcome::Invalid),
            }
        }
        let inserted = self.ctx.store.bulk_add(&policy.name, &batch).await?;
        stats.inserted += inserted;
        stats.unchanged += batch.len() - inserted;
        Ok(())
    }

    /// Merge a single remote record into the local store.
    ///
    /// Every local write is conditional on the version the decision was
    /// made against. When a local edit lands in between, the record is
    /// resolved again from the fresh copy.
    pub async fn apply_remote(&self, policy: &TablePolicy, remote: &Value) -> Result<RecordOutcome, SyncError> {
        let Some(id) = valid_id(policy, remote) else {
            return Ok(RecordOutcome::Invalid);
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            if let Some(outcome) = self.try_apply(policy, &id, remote).await? {
                return Ok(outcome);
            }
            tracing::debug!("[Pull] {}/{} changed locally while merging, retrying", policy.name, id);
        }
        tracing::warn!(
            "[Pull] {}/{} kept changing locally, keeping the local copy",
            policy.name,
            id
        );
        Ok(RecordOutcome::Protected)
    }

    /// One resolution attempt; `None` when the local record moved underneath
    async fn try_apply(
        &self,
        policy: &TablePolicy,
        id: &str,
        remote: &Value,
    ) -> Result<Option<RecordOutcome>, SyncError> {
        let table = policy.name.as_str();

        let Some(local) = self.ctx.store.get(table, id).await? else {
            let inserted = self
                .ctx
                .store
                .bulk_add(table, &[Record::from_remote(id, remote.clone())])
                .await?;
            return Ok((inserted == 1).then_some(RecordOutcome::Inserted));
        };

        if local.data == *remote {
            return Ok(Some(RecordOutcome::Unchanged));
        }

        if !local.is_synced() {
            let stale = match (record_updated_at(remote), local.updated_at()) {
                (Some(remote_ts), Some(local_ts)) => {
                    remote_ts - local_ts > self.ctx.config.staleness_threshold()
                }
                _ => false,
            };
            if !stale {
                tracing::debug!("[Pull] Keeping pending local change to {}/{}", table, id);
                return Ok(Some(RecordOutcome::Protected));
            }
            if !self.write_synced(table, &local, remote.clone()).await? {
                return Ok(None);
            }
            tracing::warn!(
                "[Pull] Pending local change to {}/{} was stale, remote version overwrote it",
                table,
                id
            );
            return Ok(Some(RecordOutcome::Applied));
        }

        let resolution = resolve(
            table,
            id,
            &local.data,
            remote,
            &policy.user_fields,
            self.ctx.config.conflict_strategy,
        );

        let outcome = match (resolution.state, resolution.data.clone()) {
            (ConflictState::RemoteWins, Some(data)) => {
                if !self.write_synced(table, &local, data).await? {
                    return Ok(None);
                }
                RecordOutcome::Applied
            }
            (ConflictState::Merged, Some(data)) => {
                // Equal timestamps where no local user field survived is just an echo.
                let kept_local = data != *remote;
                if !self.write_synced(table, &local, data).await? {
                    return Ok(None);
                }
                if kept_local {
                    self.ctx.events.emit(SyncEvent::ConflictDetected {
                        table: table.to_string(),
                        record_id: id.to_string(),
                        resolution: "merged".to_string(),
                    });
                    RecordOutcome::Merged
                } else {
                    RecordOutcome::Applied
                }
            }
            (ConflictState::ManualPending, _) => {
                let mut flagged = local.clone();
                flagged.sync_status = RecordSyncStatus::Conflict;
                flagged.last_modified = Utc::now();
                flagged.version = local.version + 1;
                if !self.ctx.store.update(table, &flagged, local.version).await? {
                    return Ok(None);
                }
                self.ctx.events.emit(SyncEvent::ConflictDetected {
                    table: table.to_string(),
                    record_id: id.to_string(),
                    resolution: "manual_pending".to_string(),
                });
                self.ctx.events.emit(SyncEvent::notification(
                    format!("{}/{} changed both locally and remotely and needs review", table, id),
                    Severity::Warning,
                ));
                RecordOutcome::Manual
            }
            _ => RecordOutcome::KeptLocal,
        };

        tracing::info!("[Pull] Resolved {}", resolution.audit);
        if resolution.exceeds_skew(self.ctx.config.skew_notification_threshold()) {
            let minutes = resolution.skew.map(|s| s.num_minutes()).unwrap_or_default();
            self.ctx.events.emit(SyncEvent::notification(
                format!(
                    "{}/{} was resolved as {:?} across {} minutes of clock skew",
                    table, id, resolution.state, minutes
                ),
                Severity::Info,
            ));
        }
        Ok(Some(outcome))
    }

    /// Replace a local record wholesale with remote data, if it is still at
    /// the version `local` was read at
    async fn write_synced(&self, table: &str, local: &Record, data: Value) -> Result<bool, SyncError> {
        let mut record = Record::from_remote(local.id.clone(), data);
        record.version = local.version + 1;
        self.ctx.store.update(table, &record, local.version).await
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Spawn a task whose completion [`PullEngine::wait_for_background`] awaits
    pub fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(future));
    }

    /// Await every background task started so far
    pub async fn wait_for_background(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = {
                let mut tasks = self
                    .background
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                tasks.drain(..).collect()
            };
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        tracing::error!("[Pull] Background task panicked: {}", e);
                    }
                }
            }
        }
    }

    /// Abort every background task
    pub fn abort_background(&self) {
        let mut tasks = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Id of a remote record that passes validation
fn valid_id(policy: &TablePolicy, remote: &Value) -> Option<String> {
    if let Err(e) = validate_record(&policy.name, Some(policy), remote) {
        tracing::warn!("[Pull] Skipping invalid remote record: {}", e);
        return None;
    }
    record_id(remote)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
