//! Database Schema Definitions
//!
//! Contains the SQL for the local store and schema-version utilities.

/// Current database schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Schema migration versions
pub const MIGRATION_VERSIONS: &[i32] = &[1];

/// Statements creating the local store. Each is idempotent.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // Mirrored records of every syncable table, payload kept as JSON.
    "CREATE TABLE IF NOT EXISTS records (
        table_name TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'pending',
        last_modified TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        deleted INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT,
        PRIMARY KEY (table_name, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_status ON records (table_name, sync_status)",
    "CREATE INDEX IF NOT EXISTS idx_records_updated ON records (table_name, updated_at)",
    // Durable log of local mutations awaiting push.
    "CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        table_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        record_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        requested_priority TEXT,
        enqueued_at TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        last_attempt TEXT,
        last_error TEXT,
        finished_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue (status, seq)",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue (table_name, record_id, status)",
    // Small key-value settings store; holds the per-table checkpoints.
    "CREATE TABLE IF NOT EXISTS sync_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    )",
];

/// Check if database needs migration
pub fn needs_migration(current_version: i32) -> bool {
    current_version < CURRENT_SCHEMA_VERSION
}

/// Get pending migrations
pub fn get_pending_migrations(current_version: i32) -> Vec<i32> {
    MIGRATION_VERSIONS
        .iter()
        .filter(|&&v| v > current_version)
        .cloned()
        .collect()
}
