//! # Mirrored Records
//!
//! The [`LocalStore`] abstraction over the records mirrored between the local
//! store and the backend, and its SQLite implementation.
//!
//! Records are only ever written wholesale, so a concurrent reader sees
//! either the previous or the next version of a record, never a partial edit.
//!
//! ## Features
//!
//! - **Point reads**: `get` by table and id
//! - **Bulk writes**: `bulk_add` and `bulk_put` run in a single transaction
//! - **Queries**: `count` and `query` filtered by [`RecordQuery`]
//! - **Tombstones**: deletions are kept with `deleted = true` until purged

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::fmt;
use std::str::FromStr;

use crate::local_db::LocalDatabase;
use crate::shared::error::SyncError;
use crate::shared::timestamp::{self, normalize_timestamp, to_canonical};

/// Synchronization state of a local record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordSyncStatus {
    /// Local change not yet acknowledged by the backend
    Pending,
    /// Matches the backend
    Synced,
    /// Awaiting manual conflict resolution
    Conflict,
}

impl RecordSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSyncStatus::Pending => "pending",
            RecordSyncStatus::Synced => "synced",
            RecordSyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for RecordSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordSyncStatus::Pending),
            "synced" => Ok(RecordSyncStatus::Synced),
            "conflict" => Ok(RecordSyncStatus::Conflict),
            other => Err(SyncError::storage(format!("unknown sync status '{}'", other))),
        }
    }
}

/// A domain entity mirrored between the local store and the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key
    pub id: String,
    /// Domain payload, a JSON object
    pub data: Value,
    /// Synchronization state
    pub sync_status: RecordSyncStatus,
    /// Local wall-clock time of the last write
    pub last_modified: DateTime<Utc>,
    /// Monotonic local version counter
    pub version: i64,
    /// Soft-delete flag
    pub deleted: bool,
}

impl Record {
    /// Build a synced record from a validated remote payload
    pub fn from_remote(id: impl Into<String>, data: Value) -> Self {
        let deleted = data.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        Self {
            id: id.into(),
            data,
            sync_status: RecordSyncStatus::Synced,
            last_modified: Utc::now(),
            version: 1,
            deleted,
        }
    }

    /// The payload's `updated_at`, if present and parseable
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        timestamp::record_updated_at(&self.data)
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == RecordSyncStatus::Synced
    }
}

/// Filter for `count` and `query`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// Only records in this state
    pub sync_status: Option<RecordSyncStatus>,
    /// Include tombstones
    pub include_deleted: bool,
    /// Only records whose `updated_at` is at or after this time
    pub updated_since: Option<DateTime<Utc>>,
    /// Maximum number of rows returned
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// Every record including tombstones
    pub fn all() -> Self {
        Self {
            include_deleted: true,
            ..Self::default()
        }
    }

    /// Records that are not tombstones
    pub fn live() -> Self {
        Self::default()
    }

    /// Records with unsynced local changes, tombstones included
    pub fn pending() -> Self {
        Self {
            sync_status: Some(RecordSyncStatus::Pending),
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Embedded, ordered, indexable local persistence layer
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch a record by id, tombstones included
    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, SyncError>;

    /// Insert a new record; fails if it already exists
    async fn add(&self, table: &str, record: &Record) -> Result<(), SyncError>;

    /// Insert records that do not exist yet; returns the number inserted
    async fn bulk_add(&self, table: &str, records: &[Record]) -> Result<usize, SyncError>;

    /// Replace a record whose stored version is still `expected_version`.
    /// Returns false when the record is missing or was written in between.
    async fn update(
        &self,
        table: &str,
        record: &Record,
        expected_version: i64,
    ) -> Result<bool, SyncError>;

    /// Insert or replace a record
    async fn put(&self, table: &str, record: &Record) -> Result<(), SyncError>;

    /// Insert or replace records in one transaction
    async fn bulk_put(&self, table: &str, records: &[Record]) -> Result<usize, SyncError>;

    /// Count records matching the query
    async fn count(&self, table: &str, query: &RecordQuery) -> Result<u64, SyncError>;

    /// Records matching the query, ordered by `updated_at`
    async fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<Record>, SyncError>;

    /// Delete synced tombstones last written before `before`; returns the
    /// number removed
    async fn purge_tombstones(&self, before: DateTime<Utc>) -> Result<u64, SyncError>;
}

const SELECT_COLUMNS: &str =
    "SELECT id, data, sync_status, last_modified, version, deleted FROM records WHERE table_name = ";

const UPSERT_SQL: &str = "INSERT INTO records (
        table_name, id, data, sync_status, last_modified, version, deleted, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (table_name, id) DO UPDATE SET
        data = excluded.data,
        sync_status = excluded.sync_status,
        last_modified = excluded.last_modified,
        version = excluded.version,
        deleted = excluded.deleted,
        updated_at = excluded.updated_at";

const INSERT_IGNORE_SQL: &str = "INSERT OR IGNORE INTO records (
        table_name, id, data, sync_status, last_modified, version, deleted, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_SQL: &str = "INSERT INTO records (
        table_name, id, data, sync_status, last_modified, version, deleted, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

/// Column values of a record, serialized once for binding
struct RecordRow {
    data: String,
    last_modified: String,
    updated_at: Option<String>,
}

impl RecordRow {
    fn from_record(record: &Record) -> Result<Self, SyncError> {
        Ok(Self {
            data: serde_json::to_string(&record.data)?,
            last_modified: to_canonical(&record.last_modified),
            updated_at: record.updated_at().map(|ts| to_canonical(&ts)),
        })
    }
}

impl LocalDatabase {
    fn row_to_record(row: &SqliteRow) -> Result<Record, SyncError> {
        let data: String = row.try_get("data")?;
        let status: String = row.try_get("sync_status")?;
        let last_modified: String = row.try_get("last_modified")?;

        Ok(Record {
            id: row.try_get("id")?,
            data: serde_json::from_str(&data)?,
            sync_status: status.parse()?,
            last_modified: normalize_timestamp(&last_modified).ok_or_else(|| {
                SyncError::storage(format!("corrupt last_modified '{}'", last_modified))
            })?,
            version: row.try_get("version")?,
            deleted: row.try_get("deleted")?,
        })
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &RecordQuery) {
        if let Some(status) = query.sync_status {
            builder.push(" AND sync_status = ").push_bind(status.as_str());
        }
        if !query.include_deleted {
            builder.push(" AND deleted = 0");
        }
        if let Some(since) = query.updated_since {
            builder
                .push(" AND updated_at >= ")
                .push_bind(to_canonical(&since));
        }
    }
}

#[async_trait]
impl LocalStore for LocalDatabase {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, SyncError> {
        let row = sqlx::query(
            "SELECT id, data, sync_status, last_modified, version, deleted
             FROM records WHERE table_name = ? AND id = ?",
        )
        .bind(table)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn add(&self, table: &str, record: &Record) -> Result<(), SyncError> {
        let row = RecordRow::from_record(record)?;
        sqlx::query(INSERT_SQL)
            .bind(table)
            .bind(&record.id)
            .bind(&row.data)
            .bind(record.sync_status.as_str())
            .bind(&row.last_modified)
            .bind(record.version)
            .bind(record.deleted)
            .bind(&row.updated_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn bulk_add(&self, table: &str, records: &[Record]) -> Result<usize, SyncError> {
        let mut tx = self.pool().begin().await?;
        let mut inserted = 0;
        for record in records {
            let row = RecordRow::from_record(record)?;
            let result = sqlx::query(INSERT_IGNORE_SQL)
                .bind(table)
                .bind(&record.id)
                .bind(&row.data)
                .bind(record.sync_status.as_str())
                .bind(&row.last_modified)
                .bind(record.version)
                .bind(record.deleted)
                .bind(&row.updated_at)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        record: &Record,
        expected_version: i64,
    ) -> Result<bool, SyncError> {
        let row = RecordRow::from_record(record)?;
        let result = sqlx::query(
            "UPDATE records SET
                data = ?, sync_status = ?, last_modified = ?, version = ?, deleted = ?, updated_at = ?
             WHERE table_name = ? AND id = ? AND version = ?",
        )
        .bind(&row.data)
        .bind(record.sync_status.as_str())
        .bind(&row.last_modified)
        .bind(record.version)
        .bind(record.deleted)
        .bind(&row.updated_at)
        .bind(table)
        .bind(&record.id)
        .bind(expected_version)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put(&self, table: &str, record: &Record) -> Result<(), SyncError> {
        let row = RecordRow::from_record(record)?;
        sqlx::query(UPSERT_SQL)
            .bind(table)
            .bind(&record.id)
            .bind(&row.data)
            .bind(record.sync_status.as_str())
            .bind(&row.last_modified)
            .bind(record.version)
            .bind(record.deleted)
            .bind(&row.updated_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn bulk_put(&self, table: &str, records: &[Record]) -> Result<usize, SyncError> {
        let mut tx = self.pool().begin().await?;
        for record in records {
            let row = RecordRow::from_record(record)?;
            sqlx::query(UPSERT_SQL)
                .bind(table)
                .bind(&record.id)
                .bind(&row.data)
                .bind(record.sync_status.as_str())
                .bind(&row.last_modified)
                .bind(record.version)
                .bind(record.deleted)
                .bind(&row.updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn count(&self, table: &str, query: &RecordQuery) -> Result<u64, SyncError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM records WHERE table_name = ");
        builder.push_bind(table);
        Self::push_filters(&mut builder, query);

        let count: (i64,) = builder.build_query_as().fetch_one(self.pool()).await?;
        Ok(count.0 as u64)
    }

    async fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<Record>, SyncError> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        builder.push_bind(table);
        Self::push_filters(&mut builder, query);
        builder.push(" ORDER BY updated_at ASC, id ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn purge_tombstones(&self, before: DateTime<Utc>) -> Result<u64, SyncError> {
        let result = sqlx::query(
            "DELETE FROM records
             WHERE deleted = 1 AND sync_status = 'synced' AND last_modified < ?",
        )
        .bind(to_canonical(&before))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
