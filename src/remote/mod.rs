//! # Remote Backend
//!
//! The engine talks to the backend only through [`RemoteBackend`]: per-table
//! change feeds and CRUD plus a few named remote procedures for work that
//! cannot be expressed as plain CRUD.
//!
//! ## Key Components
//!
//! - `RemoteBackend`: the async trait the sync engines are written against
//! - `http.rs`: [`HttpBackend`], a REST client for PostgREST-style backends

pub mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::shared::error::SyncError;

/// Column every remote row is scoped by
pub const TENANT_FIELD: &str = "tenant_id";

/// Remote data source and sink
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Records of `tenant` changed at or after `since`, oldest first
    async fn fetch_changes(
        &self,
        table: &str,
        tenant: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, SyncError>;

    /// The `limit` most recently updated records of `tenant`
    async fn fetch_recent(
        &self,
        table: &str,
        tenant: &str,
        limit: usize,
    ) -> Result<Vec<Value>, SyncError>;

    /// Number of remote records of `tenant`
    async fn count(&self, table: &str, tenant: &str) -> Result<u64, SyncError>;

    /// Insert or replace a full record; safe to repeat
    async fn upsert(&self, table: &str, tenant: &str, record: &Value) -> Result<(), SyncError>;

    /// Patch a record by id
    async fn update(
        &self,
        table: &str,
        tenant: &str,
        id: &str,
        patch: &Value,
    ) -> Result<(), SyncError>;

    /// Delete a record by id
    async fn delete(&self, table: &str, tenant: &str, id: &str) -> Result<(), SyncError>;

    /// Invoke a named remote procedure
    async fn call_rpc(&self, name: &str, args: &Value) -> Result<Value, SyncError>;

    /// Cheapest possible round trip, used for latency probes
    async fn ping(&self) -> Result<(), SyncError>;
}
