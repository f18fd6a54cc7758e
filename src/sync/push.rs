//! # Push Engine
//!
//! Drains pending queue operations against the backend.
//!
//! Operations are pushed in fixed-size batches: sequentially across batches,
//! concurrently within one. Inside a batch, operations on the same record run
//! in queue order so a delete never overtakes its create. Every operation is
//! retried with exponential backoff; one that exhausts its budget is marked
//! `failed` and stays queued for inspection. A failure never aborts its
//! siblings.

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::local_db::{LocalStore, RecordSyncStatus};
use crate::offline::queue::{OperationKind, OperationStatus, SyncOperation, SyncQueue};
use crate::remote::RemoteBackend;
use crate::shared::config::{DeletePolicy, SyncConfig, TablePolicy};
use crate::shared::error::SyncError;
use crate::shared::event::{EventBus, Severity, SyncEvent};
use crate::shared::timestamp::to_canonical;

/// Everything a push needs, passed explicitly
pub struct PushContext {
    pub queue: Arc<SyncQueue>,
    pub store: Arc<dyn LocalStore>,
    pub backend: Arc<dyn RemoteBackend>,
    pub events: EventBus,
    pub config: Arc<SyncConfig>,
}

/// Result of pushing one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub id: Uuid,
    pub table: String,
    pub record_id: String,
    pub kind: OperationKind,
    /// `Pending` when the push was deferred behind a failed predecessor
    pub status: OperationStatus,
    pub attempts: u32,
    /// Backoff slept before each retry
    pub delays: Vec<Duration>,
    pub error: Option<String>,
}

/// Result of one drain
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Left pending because an earlier operation on the same record failed
    pub deferred: usize,
    pub outcomes: Vec<OperationOutcome>,
}

impl PushSummary {
    fn add(&mut self, outcome: OperationOutcome) {
        match outcome.status {
            OperationStatus::Completed => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            OperationStatus::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            OperationStatus::Pending => self.deferred += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// The push engine
pub struct PushEngine {
    ctx: PushContext,
}

impl std::fmt::Debug for PushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushEngine")
            .field("queue", &self.ctx.queue)
            .finish_non_exhaustive()
    }
}

impl PushEngine {
    pub fn new(ctx: PushContext) -> Self {
        Self { ctx }
    }

    /// Push every pending operation in dispatch order
    pub async fn drain(&self) -> Result<PushSummary, SyncError> {
        let operations: Vec<SyncOperation> = self
            .ctx
            .queue
            .drainable()
            .await?
            .into_iter()
            .map(|p| p.operation)
            .collect();

        let total = operations.len();
        let mut summary = PushSummary::default();
        if total == 0 {
            return Ok(summary);
        }

        tracing::info!("[Push] Draining {} operations", total);
        let batch_size = self.ctx.config.push_batch_size.max(1);
        let mut done = 0;

        for batch in operations.chunks(batch_size) {
            let groups = group_by_record(batch);
            let results = join_all(groups.into_iter().map(|group| self.push_group(group))).await;
            for outcome in results.into_iter().flatten() {
                summary.add(outcome);
            }

            done += batch.len();
            self.ctx.events.emit(SyncEvent::ProgressUpdate {
                current: done,
                total,
            });
        }

        tracing::info!(
            "[Push] Drain finished: {} succeeded, {} failed, {} deferred",
            summary.succeeded,
            summary.failed,
            summary.deferred
        );
        Ok(summary)
    }

    /// Push one record's operations in order, stopping at the first failure
    async fn push_group(&self, group: Vec<SyncOperation>) -> Vec<OperationOutcome> {
        let mut outcomes = Vec::with_capacity(group.len());
        let mut blocked = false;

        for operation in group {
            if blocked {
                tracing::debug!(
                    "[Push] Deferring {} {}/{} behind a failed operation",
                    operation.kind,
                    operation.table,
                    operation.record_id
                );
                outcomes.push(OperationOutcome {
                    id: operation.id,
                    table: operation.table,
                    record_id: operation.record_id,
                    kind: operation.kind,
                    status: OperationStatus::Pending,
                    attempts: 0,
                    delays: Vec::new(),
                    error: None,
                });
                continue;
            }

            let outcome = self.push_one(operation).await;
            blocked = outcome.status != OperationStatus::Completed;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Push a single operation with retries and record the result
    pub async fn push_one(&self, mut operation: SyncOperation) -> OperationOutcome {
        let policy = self.ctx.config.table(&operation.table).cloned();
        let retry = &self.ctx.config.retry;
        let max_retries = if uses_commit_rpc(&operation, policy.as_ref()) {
            retry.max_retries.min(1)
        } else {
            retry.max_retries
        };

        let report = {
            let op = &operation;
            let policy = policy.as_ref();
            retry
                .run(max_retries, move |attempt| {
                    if attempt > 0 {
                        tracing::debug!(
                            "[Push] Retry {} of {} {}/{}",
                            attempt,
                            op.kind,
                            op.table,
                            op.record_id
                        );
                    }
                    self.dispatch(op, policy)
                })
                .await
        };
        operation.retry_count = report.retries;

        let error = match report.result {
            Ok(()) => {
                if let Err(e) = self.ctx.queue.mark_completed(&mut operation).await {
                    tracing::error!("[Push] Failed to mark {} completed: {}", operation.id, e);
                }
                if let Err(e) = self.mark_record_synced(&operation).await {
                    tracing::error!(
                        "[Push] Failed to mark {}/{} synced: {}",
                        operation.table,
                        operation.record_id,
                        e
                    );
                }
                None
            }
            Err(e) => {
                tracing::warn!(
                    "[Push] {} {}/{} failed after {} attempts: {}",
                    operation.kind,
                    operation.table,
                    operation.record_id,
                    report.attempts,
                    e
                );
                if matches!(e, SyncError::QuotaOrBusinessRule { .. }) {
                    self.ctx.events.emit(SyncEvent::notification(
                        format!("{} change to {} was rejected: {}", operation.table, operation.record_id, e),
                        Severity::Warning,
                    ));
                }
                if let Err(store_err) = self.ctx.queue.mark_failed(&mut operation, &e).await {
                    tracing::error!("[Push] Failed to mark {} failed: {}", operation.id, store_err);
                }
                Some(e.to_string())
            }
        };

        OperationOutcome {
            id: operation.id,
            table: operation.table,
            record_id: operation.record_id,
            kind: operation.kind,
            status: operation.status,
            attempts: report.attempts,
            delays: report.delays,
            error,
        }
    }

    async fn dispatch(&self, op: &SyncOperation, policy: Option<&TablePolicy>) -> Result<(), SyncError> {
        let backend = &self.ctx.backend;
        let tenant = self.ctx.config.tenant_id.as_str();

        if let Some(rpc) = policy.and_then(|p| p.commit_rpc.as_deref()) {
            if op.kind != OperationKind::Delete {
                let args = json!({
                    "tenant_id": tenant,
                    "table": op.table,
                    "record_id": op.record_id,
                    "operation": op.kind.as_str(),
                    "payload": op.payload,
                });
                backend.call_rpc(rpc, &args).await?;
                return Ok(());
            }
        }

        match op.kind {
            OperationKind::Create => backend.upsert(&op.table, tenant, &op.payload).await,
            OperationKind::Update => {
                backend
                    .update(&op.table, tenant, &op.record_id, &op.payload)
                    .await
            }
            OperationKind::Delete => match policy.map(|p| p.delete_policy).unwrap_or_default() {
                DeletePolicy::Remote => backend.delete(&op.table, tenant, &op.record_id).await,
                DeletePolicy::Soft => {
                    let patch = json!({
                        "deleted": true,
                        "updated_at": to_canonical(&op.enqueued_at),
                    });
                    backend.update(&op.table, tenant, &op.record_id, &patch).await
                }
            },
        }
    }

    /// Mark the local record synced once nothing else is pending for it.
    ///
    /// The record is read before the queue is checked, and the write only
    /// lands on that version, so an edit enqueued in between stays pending.
    async fn mark_record_synced(&self, op: &SyncOperation) -> Result<(), SyncError> {
        let Some(mut record) = self.ctx.store.get(&op.table, &op.record_id).await? else {
            return Ok(());
        };
        if record.sync_status != RecordSyncStatus::Pending {
            return Ok(());
        }
        if self
            .ctx
            .queue
            .has_pending_for(&op.table, &op.record_id, Some(op.id))
            .await?
        {
            return Ok(());
        }

        let expected = record.version;
        record.sync_status = RecordSyncStatus::Synced;
        record.version = expected + 1;
        if !self.ctx.store.update(&op.table, &record, expected).await? {
            tracing::debug!(
                "[Push] {}/{} changed locally after the push, leaving it pending",
                op.table,
                op.record_id
            );
        }
        Ok(())
    }
}

fn uses_commit_rpc(op: &SyncOperation, policy: Option<&TablePolicy>) -> bool {
    op.kind != OperationKind::Delete && policy.and_then(|p| p.commit_rpc.as_ref()).is_some()
}

/// Split a batch into per-record groups, keeping queue order inside each
fn group_by_record(batch: &[SyncOperation]) -> Vec<Vec<SyncOperation>> {
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut groups: Vec<Vec<SyncOperation>> = Vec::new();
    for op in batch {
        let key = (op.table.as_str(), op.record_id.as_str());
        match index.get(&key) {
            Some(&i) => groups[i].push(op.clone()),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![op.clone()]);
            }
        }
    }
    groups
}
