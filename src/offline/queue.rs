//! # Sync Queue
//!
//! Durable, ordered log of local mutations awaiting transmission to the
//! backend. Entries are append-only until their status transitions.
//!
//! ## Features
//!
//! - **Persistent Queue**: operations survive restarts (stored through [`QueueStore`])
//! - **Priority Classes**: critical operations drain before anything else, FIFO within a class
//! - **Per-Record Ordering**: a record's operations share its most urgent priority
//! - **Bounded Size**: overflow evicts the oldest least-urgent entry, never a critical one
//! - **Cleanup**: finished entries are purged after their retention
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::local_db::LocalDatabase;
//! use offline_sync::offline::queue::{OperationKind, SyncQueue};
//! use offline_sync::shared::SyncConfig;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), offline_sync::shared::SyncError> {
//! let db = Arc::new(LocalDatabase::in_memory().await?);
//! let config = SyncConfig::builder().tenant_id("acme").build().unwrap();
//! let queue = SyncQueue::new(db, &config);
//!
//! queue
//!     .enqueue("contacts", OperationKind::Create, "c-1", json!({"phone": "+100"}), None)
//!     .await?;
//!
//! for op in queue.drainable().await? {
//!     println!("{} {:?}", op.operation.record_id, op.priority);
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::local_db::QueueStore;
use crate::offline::optimistic::stamp_payload;
use crate::shared::config::{SyncConfig, TablePolicy};
use crate::shared::error::SyncError;
use crate::shared::timestamp::{self, ID_FIELD};

/// Error recorded on operations dropped to make room for more urgent work
pub const EVICTION_ERROR: &str = "evicted: queue overflow";

/// Kind of local mutation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(SyncError::storage(format!("unknown operation kind '{}'", other))),
        }
    }
}

/// Operation execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be pushed
    Pending,
    /// Successfully pushed
    Completed,
    /// Retries exhausted or evicted, kept for inspection
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(SyncError::storage(format!("unknown operation status '{}'", other))),
        }
    }
}

/// Operation priority classes, most urgent first
///
/// The derived ordering sorts `Critical` before `Background`, so sorting
/// ascending yields dispatch order.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Deletes and quota-affecting updates
    Critical,
    /// User-facing entities
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl FromStr for Priority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(SyncError::storage(format!("unknown priority '{}'", other))),
        }
    }
}

/// A durable queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Operation ID
    pub id: Uuid,
    /// Insertion sequence, assigned by the store
    pub seq: i64,
    /// Target table
    pub table: String,
    /// Mutation kind
    pub kind: OperationKind,
    /// Target record
    pub record_id: String,
    /// Full record for creates, patch for updates
    pub payload: Value,
    /// Priority requested by the caller
    pub requested_priority: Option<Priority>,
    /// Timestamp when queued
    pub enqueued_at: DateTime<Utc>,
    /// Number of retries spent
    pub retry_count: u32,
    /// Current status
    pub status: OperationStatus,
    /// Timestamp of last attempt
    pub last_attempt: Option<DateTime<Utc>>,
    /// Error message from last failure
    pub last_error: Option<String>,
    /// Timestamp of the terminal status transition
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    /// Create a new pending operation
    pub fn new(
        table: impl Into<String>,
        kind: OperationKind,
        record_id: impl Into<String>,
        payload: Value,
        requested_priority: Option<Priority>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            table: table.into(),
            kind,
            record_id: record_id.into(),
            payload,
            requested_priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_attempt: None,
            last_error: None,
            finished_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }
}

/// A queue entry decorated with its dispatch priority. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PrioritizedOperation {
    pub operation: SyncOperation,
    /// Priority the operation is dispatched with
    pub priority: Priority,
    /// Serialized payload size in bytes
    pub estimated_size: usize,
}

/// Priority class a mutation earns from its kind and table policy
pub fn derive_priority(kind: OperationKind, policy: Option<&TablePolicy>) -> Priority {
    match (kind, policy) {
        (OperationKind::Delete, _) => Priority::Critical,
        (OperationKind::Update, Some(p)) if p.quota_affecting => Priority::Critical,
        (_, Some(p)) => p.priority,
        (_, None) => Priority::Low,
    }
}

/// Priority of one operation: the caller's request, except that a
/// critical classification is never downgraded
pub fn operation_priority(op: &SyncOperation, policy: Option<&TablePolicy>) -> Priority {
    let derived = derive_priority(op.kind, policy);
    if derived == Priority::Critical {
        return Priority::Critical;
    }
    op.requested_priority.unwrap_or(derived)
}

/// Decorate and sort pending operations into dispatch order.
///
/// Every operation inherits the most urgent priority among the pending
/// operations of its record, then the list is sorted by
/// `(priority, enqueued_at, seq)`.
pub fn prioritize(
    operations: Vec<SyncOperation>,
    tables: &HashMap<String, TablePolicy>,
) -> Vec<PrioritizedOperation> {
    let mut record_priority: HashMap<(String, String), Priority> = HashMap::new();
    for op in &operations {
        let priority = operation_priority(op, tables.get(&op.table));
        record_priority
            .entry((op.table.clone(), op.record_id.clone()))
            .and_modify(|p| *p = (*p).min(priority))
            .or_insert(priority);
    }

    let mut prioritized: Vec<PrioritizedOperation> = operations
        .into_iter()
        .map(|op| {
            let priority = record_priority
                .get(&(op.table.clone(), op.record_id.clone()))
                .copied()
                .unwrap_or(Priority::Low);
            let estimated_size = serde_json::to_string(&op.payload)
                .map(|s| s.len())
                .unwrap_or(0);
            PrioritizedOperation {
                operation: op,
                priority,
                estimated_size,
            }
        })
        .collect();

    prioritized.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.operation.enqueued_at.cmp(&b.operation.enqueued_at))
            .then(a.operation.seq.cmp(&b.operation.seq))
    });
    prioritized
}

/// Check a mutation against its table before it is queued
pub fn validate_payload(
    table: &str,
    kind: OperationKind,
    record_id: &str,
    payload: &Value,
    policy: Option<&TablePolicy>,
) -> Result<(), SyncError> {
    let policy =
        policy.ok_or_else(|| SyncError::validation(table, "<table>", "table is not syncable"))?;

    if record_id.trim().is_empty() {
        return Err(SyncError::validation(table, ID_FIELD, "record id is empty"));
    }

    if kind == OperationKind::Delete {
        return Ok(());
    }

    let object = payload
        .as_object()
        .ok_or_else(|| SyncError::validation(table, "<payload>", "payload must be a JSON object"))?;

    if let Some(id) = timestamp::record_id(payload) {
        if id != record_id {
            return Err(SyncError::validation(
                table,
                ID_FIELD,
                format!("payload id '{}' does not match '{}'", id, record_id),
            ));
        }
    }

    match kind {
        OperationKind::Create => {
            for field in &policy.required_fields {
                if matches!(object.get(field), None | Some(Value::Null)) {
                    return Err(SyncError::validation(table, field.as_str(), "required field missing"));
                }
            }
        }
        OperationKind::Update => {
            if object.is_empty() {
                return Err(SyncError::validation(table, "<payload>", "update patch is empty"));
            }
            for field in &policy.required_fields {
                if matches!(object.get(field), Some(Value::Null)) {
                    return Err(SyncError::validation(
                        table,
                        field.as_str(),
                        "required field cannot be cleared",
                    ));
                }
            }
        }
        OperationKind::Delete => {}
    }

    Ok(())
}

/// Result of admitting an operation into the queue
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    /// The persisted operation
    pub operation: SyncOperation,
    /// Priority the operation was classified with
    pub priority: Priority,
    /// Operation dropped to make room, if any
    pub evicted: Option<Uuid>,
    /// The queue is over capacity with nothing left to evict
    pub overflow: bool,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of pending operations
    pub pending: u64,
    /// Number of completed operations awaiting purge
    pub completed: u64,
    /// Number of failed operations
    pub failed: u64,
}

/// The sync queue
pub struct SyncQueue {
    store: Arc<dyn QueueStore>,
    tables: HashMap<String, TablePolicy>,
    max_size: usize,
    /// Serializes admission so the capacity check and insert are atomic
    admission: Mutex<()>,
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl SyncQueue {
    /// Create a new queue over a store
    pub fn new(store: Arc<dyn QueueStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            tables: config.table_map(),
            max_size: config.max_queue_size,
            admission: Mutex::new(()),
        }
    }

    /// Policy of a table, if it is syncable
    pub fn table(&self, name: &str) -> Option<&TablePolicy> {
        self.tables.get(name)
    }

    /// Validate, classify and persist a new operation.
    ///
    /// The caller's payload is validated as given, then stamped with the
    /// record id and a fresh `updated_at`. Never touches the network. Fails
    /// with `Validation` when the payload does not fit the table and with
    /// `QueueOverflow` when the queue is full of work at least as urgent as
    /// the incoming operation.
    pub async fn enqueue(
        &self,
        table: &str,
        kind: OperationKind,
        record_id: &str,
        payload: Value,
        requested_priority: Option<Priority>,
    ) -> Result<EnqueueReceipt, SyncError> {
        let policy = self.tables.get(table);
        validate_payload(table, kind, record_id, &payload, policy)?;
        let payload = stamp_payload(kind, record_id, payload, Utc::now());

        let mut operation = SyncOperation::new(table, kind, record_id, payload, requested_priority);
        let priority = operation_priority(&operation, policy);

        let _guard = self.admission.lock().await;

        let mut evicted = None;
        let mut overflow = false;
        let pending = self.store.count_operations(OperationStatus::Pending).await?;
        if pending as usize >= self.max_size {
            match self.eviction_candidate().await? {
                Some(candidate) if priority <= candidate.priority => {
                    let mut victim = candidate.operation;
                    victim.status = OperationStatus::Failed;
                    victim.last_error = Some(EVICTION_ERROR.to_string());
                    victim.finished_at = Some(Utc::now());
                    self.store.update_operation(&victim).await?;
                    tracing::warn!(
                        "[Queue] Evicted {} {}/{} ({:?}) to admit {:?} operation",
                        victim.kind,
                        victim.table,
                        victim.record_id,
                        candidate.priority,
                        priority
                    );
                    evicted = Some(victim.id);
                }
                Some(candidate) => {
                    return Err(SyncError::queue_overflow(format!(
                        "queue holds {} operations; incoming {:?} is less urgent than {:?}",
                        pending, priority, candidate.priority
                    )));
                }
                None if priority == Priority::Critical => {
                    tracing::error!(
                        "[Queue] Over capacity with only critical work queued, admitting {}/{}",
                        table,
                        record_id
                    );
                    overflow = true;
                }
                None => {
                    return Err(SyncError::queue_overflow(format!(
                        "queue holds {} critical operations",
                        pending
                    )));
                }
            }
        }

        operation.seq = self.store.insert_operation(&operation).await?;
        tracing::debug!(
            "[Queue] Enqueued {} {}/{} as {:?}",
            kind,
            table,
            record_id,
            priority
        );

        Ok(EnqueueReceipt {
            operation,
            priority,
            evicted,
            overflow,
        })
    }

    /// Oldest pending operation of the least urgent class, never a critical one
    async fn eviction_candidate(&self) -> Result<Option<PrioritizedOperation>, SyncError> {
        let ops = self.drainable().await?;
        let least_urgent = match ops.iter().map(|op| op.priority).max() {
            Some(p) if p != Priority::Critical => p,
            _ => return Ok(None),
        };
        Ok(ops.into_iter().find(|op| op.priority == least_urgent))
    }

    /// All pending operations in dispatch order
    pub async fn drainable(&self) -> Result<Vec<PrioritizedOperation>, SyncError> {
        let pending = self
            .store
            .load_operations(Some(OperationStatus::Pending))
            .await?;
        Ok(prioritize(pending, &self.tables))
    }

    /// Mark an operation pushed
    pub async fn mark_completed(&self, operation: &mut SyncOperation) -> Result<(), SyncError> {
        let now = Utc::now();
        operation.status = OperationStatus::Completed;
        operation.last_attempt = Some(now);
        operation.finished_at = Some(now);
        self.store.update_operation(operation).await
    }

    /// Mark an operation permanently failed; it stays visible for inspection
    pub async fn mark_failed(
        &self,
        operation: &mut SyncOperation,
        error: &SyncError,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        operation.status = OperationStatus::Failed;
        operation.last_attempt = Some(now);
        operation.last_error = Some(error.to_string());
        operation.finished_at = Some(now);
        self.store.update_operation(operation).await
    }

    /// Remove an operation that must not be pushed
    pub async fn discard(&self, operation: &SyncOperation) -> Result<(), SyncError> {
        self.store.delete_operation(operation.id).await?;
        tracing::debug!(
            "[Queue] Discarded {} {}/{}",
            operation.kind,
            operation.table,
            operation.record_id
        );
        Ok(())
    }

    /// Whether a record has pending operations besides `except`
    pub async fn has_pending_for(
        &self,
        table: &str,
        record_id: &str,
        except: Option<Uuid>,
    ) -> Result<bool, SyncError> {
        self.store.has_pending_for(table, record_id, except).await
    }

    /// Failed operations, oldest first
    pub async fn failed_operations(&self) -> Result<Vec<SyncOperation>, SyncError> {
        self.store.load_operations(Some(OperationStatus::Failed)).await
    }

    /// Re-arm every failed operation for another round of pushes
    pub async fn retry_failed(&self) -> Result<usize, SyncError> {
        let failed = self.failed_operations().await?;
        let count = failed.len();
        for mut op in failed {
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.finished_at = None;
            self.store.update_operation(&op).await?;
        }
        if count > 0 {
            tracing::info!("[Queue] Re-armed {} failed operations", count);
        }
        Ok(count)
    }

    /// Delete finished operations older than their retention
    pub async fn purge_finished(
        &self,
        completed_retention: chrono::Duration,
        failed_retention: chrono::Duration,
    ) -> Result<u64, SyncError> {
        let now = Utc::now();
        let completed = self
            .store
            .purge_operations(OperationStatus::Completed, now - completed_retention)
            .await?;
        let failed = self
            .store
            .purge_operations(OperationStatus::Failed, now - failed_retention)
            .await?;
        if completed + failed > 0 {
            tracing::info!(
                "[Queue] Purged {} completed and {} failed operations",
                completed,
                failed
            );
        }
        Ok(completed + failed)
    }

    /// Get queue statistics
    pub async fn stats(&self) -> Result<QueueStats, SyncError> {
        Ok(QueueStats {
            pending: self.store.count_operations(OperationStatus::Pending).await?,
            completed: self.store.count_operations(OperationStatus::Completed).await?,
            failed: self.store.count_operations(OperationStatus::Failed).await?,
        })
    }
}
