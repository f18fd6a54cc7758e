//! # Optimistic Local Apply
//!
//! Mutations are written to the local store at enqueue time so readers see
//! them immediately, online or offline. Each write replaces the record
//! wholesale and marks it `pending` until the push confirms it.
//!
//! ## Features
//!
//! - **Immediate Visibility**: creates insert, updates merge their patch, deletes leave a tombstone
//! - **Timestamp Stamping**: every local write carries a fresh `updated_at`
//! - **Version Tracking**: the local version counter grows on every write
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offline_sync::offline::optimistic::{apply_local, stamp_payload};
//! use offline_sync::offline::queue::{OperationKind, SyncOperation};
//! use offline_sync::local_db::LocalDatabase;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), offline_sync::shared::SyncError> {
//! let db = LocalDatabase::in_memory().await?;
//! let payload = stamp_payload(OperationKind::Create, "c-1", json!({"phone": "+100"}), chrono::Utc::now());
//! let op = SyncOperation::new("contacts", OperationKind::Create, "c-1", payload, None);
//! let record = apply_local(&db, &op).await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::local_db::{LocalStore, Record, RecordSyncStatus};
use crate::offline::queue::{OperationKind, SyncOperation};
use crate::shared::error::SyncError;
use crate::shared::timestamp::{to_canonical, ID_FIELD, UPDATED_AT_FIELD};

/// Add the record id and a fresh `updated_at` to a create or update payload
pub fn stamp_payload(kind: OperationKind, record_id: &str, payload: Value, now: DateTime<Utc>) -> Value {
    match (kind, payload) {
        (OperationKind::Delete, payload) => payload,
        (_, Value::Object(mut object)) => {
            if kind == OperationKind::Create {
                object.insert(ID_FIELD.to_string(), Value::String(record_id.to_string()));
            }
            object.insert(UPDATED_AT_FIELD.to_string(), Value::String(to_canonical(&now)));
            Value::Object(object)
        }
        (_, other) => other,
    }
}

/// Shallow-merge a patch into a record payload
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    if let Some(patch) = patch.as_object() {
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Attempts at a conditional local write before giving up
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// Apply a queued mutation to the local store.
///
/// Returns the record as written, or `None` for a delete of a record the
/// store never held. The write only lands on the version it was computed
/// from; a concurrent writer makes it start over from the fresh record.
pub async fn apply_local(
    store: &dyn LocalStore,
    operation: &SyncOperation,
) -> Result<Option<Record>, SyncError> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        let existing = store.get(&operation.table, &operation.record_id).await?;
        let Some(record) = next_local(operation, existing.as_ref()) else {
            return Ok(None);
        };

        let written = match &existing {
            Some(existing) => {
                store
                    .update(&operation.table, &record, existing.version)
                    .await?
            }
            None => store.bulk_add(&operation.table, std::slice::from_ref(&record)).await? == 1,
        };
        if written {
            tracing::debug!(
                "[Queue] Applied {} {}/{} locally (v{})",
                operation.kind,
                operation.table,
                operation.record_id,
                record.version
            );
            return Ok(Some(record));
        }
        tracing::debug!(
            "[Queue] {}/{} changed during the local apply, retrying",
            operation.table,
            operation.record_id
        );
    }

    Err(SyncError::storage(format!(
        "{}/{} kept changing during the local apply",
        operation.table, operation.record_id
    )))
}

/// The record an operation produces on top of `existing`
fn next_local(operation: &SyncOperation, existing: Option<&Record>) -> Option<Record> {
    let now = Utc::now();
    let version = existing.map(|r| r.version + 1).unwrap_or(1);

    let (data, deleted) = match operation.kind {
        OperationKind::Create => (with_id(operation.payload.clone(), &operation.record_id), false),
        OperationKind::Update => {
            let base = existing
                .map(|r| r.data.clone())
                .unwrap_or_else(|| Value::Object(Map::new()));
            (
                with_id(merge_patch(&base, &operation.payload), &operation.record_id),
                existing.map(|r| r.deleted).unwrap_or(false),
            )
        }
        OperationKind::Delete => {
            let mut data = existing?.data.clone();
            if let Some(object) = data.as_object_mut() {
                object.insert(UPDATED_AT_FIELD.to_string(), Value::String(to_canonical(&now)));
            }
            (data, true)
        }
    };

    Some(Record {
        id: operation.record_id.clone(),
        data,
        sync_status: RecordSyncStatus::Pending,
        last_modified: now,
        version,
        deleted,
    })
}

fn with_id(payload: Value, record_id: &str) -> Value {
    match payload {
        Value::Object(mut object) => {
            object
                .entry(ID_FIELD.to_string())
                .or_insert_with(|| Value::String(record_id.to_string()));
            Value::Object(object)
        }
        other => other,
    }
}
