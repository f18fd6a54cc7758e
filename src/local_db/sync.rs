//! # Sync Metadata Operations
//!
//! Persistence for the sync queue and for the key-value settings store that
//! keeps per-table checkpoints across restarts.
//!
//! ## Features
//!
//! - **Queue Persistence**: append-only entries, mutated only on status transition
//! - **Settings Store**: simple string key-value pairs
//! - **Cleanup**: purge finished operations past their retention

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::local_db::LocalDatabase;
use crate::offline::queue::{OperationKind, OperationStatus, Priority, SyncOperation};
use crate::shared::error::SyncError;
use crate::shared::timestamp::{normalize_timestamp, to_canonical};

/// Durable storage behind the sync queue
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new operation and return its sequence number
    async fn insert_operation(&self, operation: &SyncOperation) -> Result<i64, SyncError>;

    /// Operations in enqueue order, optionally filtered by status
    async fn load_operations(
        &self,
        status: Option<OperationStatus>,
    ) -> Result<Vec<SyncOperation>, SyncError>;

    /// Persist the mutable fields (status, retries, error, timestamps)
    async fn update_operation(&self, operation: &SyncOperation) -> Result<(), SyncError>;

    /// Delete an operation outright
    async fn delete_operation(&self, id: Uuid) -> Result<(), SyncError>;

    /// Count operations in a status
    async fn count_operations(&self, status: OperationStatus) -> Result<u64, SyncError>;

    /// Whether a record has pending operations other than `except`
    async fn has_pending_for(
        &self,
        table: &str,
        record_id: &str,
        except: Option<Uuid>,
    ) -> Result<bool, SyncError>;

    /// Delete operations in `status` that finished before `before`
    async fn purge_operations(
        &self,
        status: OperationStatus,
        before: DateTime<Utc>,
    ) -> Result<u64, SyncError>;
}

/// Simple key-value settings store
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, SyncError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), SyncError>;
}

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>, SyncError> {
    normalize_timestamp(raw)
        .ok_or_else(|| SyncError::storage(format!("corrupt {} '{}'", column, raw)))
}

fn parse_optional_time(raw: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
    raw.map(|r| parse_time(&r, column)).transpose()
}

impl LocalDatabase {
    fn row_to_operation(row: &SqliteRow) -> Result<SyncOperation, SyncError> {
        let id: String = row.try_get("id")?;
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        let payload: String = row.try_get("payload")?;
        let priority: Option<String> = row.try_get("requested_priority")?;
        let enqueued_at: String = row.try_get("enqueued_at")?;
        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(SyncOperation {
            id: Uuid::parse_str(&id).map_err(|e| SyncError::storage(e.to_string()))?,
            seq: row.try_get("seq")?,
            table: row.try_get("table_name")?,
            kind: kind.parse::<OperationKind>()?,
            record_id: row.try_get("record_id")?,
            payload: serde_json::from_str(&payload)?,
            requested_priority: priority.map(|p| p.parse::<Priority>()).transpose()?,
            enqueued_at: parse_time(&enqueued_at, "enqueued_at")?,
            retry_count: retry_count.max(0) as u32,
            status: status.parse::<OperationStatus>()?,
            last_attempt: parse_optional_time(row.try_get("last_attempt")?, "last_attempt")?,
            last_error: row.try_get("last_error")?,
            finished_at: parse_optional_time(row.try_get("finished_at")?, "finished_at")?,
        })
    }
}

#[async_trait]
impl QueueStore for LocalDatabase {
    async fn insert_operation(&self, operation: &SyncOperation) -> Result<i64, SyncError> {
        let payload = serde_json::to_string(&operation.payload)?;

        let result = sqlx::query(
            "INSERT INTO sync_queue (
                id, table_name, kind, record_id, payload, requested_priority,
                enqueued_at, retry_count, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(operation.id.to_string())
        .bind(&operation.table)
        .bind(operation.kind.as_str())
        .bind(&operation.record_id)
        .bind(&payload)
        .bind(operation.requested_priority.map(|p| p.as_str()))
        .bind(to_canonical(&operation.enqueued_at))
        .bind(operation.retry_count as i64)
        .bind(operation.status.as_str())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn load_operations(
        &self,
        status: Option<OperationStatus>,
    ) -> Result<Vec<SyncOperation>, SyncError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM sync_queue WHERE status = ? ORDER BY seq ASC")
                    .bind(status.as_str())
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM sync_queue ORDER BY seq ASC")
                    .fetch_all(self.pool())
                    .await?
            }
        };

        let mut operations = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_operation(row) {
                Ok(op) => operations.push(op),
                Err(e) => tracing::warn!("[Queue] Skipping malformed queue entry: {}", e),
            }
        }
        Ok(operations)
    }

    async fn update_operation(&self, operation: &SyncOperation) -> Result<(), SyncError> {
        sqlx::query(
            "UPDATE sync_queue SET
                status = ?,
                retry_count = ?,
                last_attempt = ?,
                last_error = ?,
                finished_at = ?
             WHERE id = ?",
        )
        .bind(operation.status.as_str())
        .bind(operation.retry_count as i64)
        .bind(operation.last_attempt.as_ref().map(to_canonical))
        .bind(&operation.last_error)
        .bind(operation.finished_at.as_ref().map(to_canonical))
        .bind(operation.id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_operation(&self, id: Uuid) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn count_operations(&self, status: OperationStatus) -> Result<u64, SyncError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(count.0 as u64)
    }

    async fn has_pending_for(
        &self,
        table: &str,
        record_id: &str,
        except: Option<Uuid>,
    ) -> Result<bool, SyncError> {
        let except = except.map(|id| id.to_string()).unwrap_or_default();
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_queue
             WHERE table_name = ? AND record_id = ? AND status = 'pending' AND id != ?",
        )
        .bind(table)
        .bind(record_id)
        .bind(&except)
        .fetch_one(self.pool())
        .await?;
        Ok(count.0 > 0)
    }

    async fn purge_operations(
        &self,
        status: OperationStatus,
        before: DateTime<Utc>,
    ) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "DELETE FROM sync_queue
             WHERE status = ? AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(status.as_str())
        .bind(to_canonical(&before))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SettingsStore for LocalDatabase {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, SyncError> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
