//! # Local Database Module
//!
//! SQLite-backed local store for offline-first operation. One database holds
//! the mirrored records of every syncable table, the durable sync queue and
//! the small settings store that keeps per-table checkpoints.
//!
//! ## Key Components
//!
//! - `LocalDatabase`: connection pool and schema management
//! - `schema.rs`: schema statements and migration versions
//! - `records.rs`: the [`LocalStore`] abstraction over mirrored records
//! - `sync.rs`: queue persistence ([`QueueStore`]) and settings ([`SettingsStore`])
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offline_sync::local_db::{LocalDatabase, LocalStore, RecordQuery};
//!
//! # async fn example() -> Result<(), offline_sync::shared::SyncError> {
//! let db = LocalDatabase::open(LocalDatabase::default_path()).await?;
//! let pending = db.query("contacts", &RecordQuery::pending()).await?;
//! # Ok(())
//! # }
//! ```

pub mod records;
pub mod schema;
pub mod sync;

pub use records::{LocalStore, Record, RecordQuery, RecordSyncStatus};
pub use sync::{QueueStore, SettingsStore};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::shared::error::SyncError;

/// Result type for local database operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Local database connection manager
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open or create a database file
    ///
    /// Creates the file and its directory if missing, enables WAL mode and
    /// initializes the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::storage(format!("{}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        tracing::info!("[LocalDb] Opened {}", path.display());
        Ok(db)
    }

    /// Open a private in-memory database
    ///
    /// A single connection is kept alive for the lifetime of the pool, since
    /// every new in-memory connection would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Platform-specific default database location
    pub fn default_path() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        path.push("offline-sync");
        path.push("local.db");
        path
    }

    /// Create all tables and run pending migrations
    async fn init_schema(&self) -> Result<()> {
        for statement in schema::SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.run_migrations().await
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version: (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        for version in schema::get_pending_migrations(current_version.0) {
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            tracing::debug!("[LocalDb] Applied migration {}", version);
        }
        Ok(())
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Basic statistics for diagnostics
    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        let record_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;

        let tombstone_count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM records WHERE deleted = 1")
                .fetch_one(&self.pool)
                .await?;

        let pending_operations: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        Ok(DatabaseStats {
            record_count: record_count.0 as u64,
            tombstone_count: tombstone_count.0 as u64,
            pending_operations: pending_operations.0 as u64,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Records mirrored locally, tombstones included
    pub record_count: u64,
    /// Soft-deleted records awaiting purge
    pub tombstone_count: u64,
    /// Queue entries waiting to be pushed
    pub pending_operations: u64,
}
