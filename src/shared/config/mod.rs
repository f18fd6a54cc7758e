//! Engine configuration
//!
//! [`SyncConfig`] carries every tunable of the engine. It deserializes from
//! TOML with every field defaulted, can be overlaid from environment
//! variables, and is built programmatically through [`SyncConfigBuilder`].
//!
//! ```rust
//! use offline_sync::shared::config::SyncConfig;
//!
//! let config = SyncConfig::builder()
//!     .tenant_id("acme")
//!     .backend_url("https://api.example.com")
//!     .build()
//!     .unwrap();
//! assert_eq!(config.push_batch_size, 50);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::offline::queue::Priority;
use crate::offline::retry::RetryPolicy;
use crate::sync::conflict_resolver::ConflictStrategy;

/// How a table propagates local deletions to the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Delete the remote row
    #[default]
    Remote,
    /// Patch the remote row with `deleted = true`
    Soft,
}

/// Per-table synchronization policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TablePolicy {
    /// Table name, shared by the local store and the backend
    pub name: String,
    /// Fields a created record must carry
    pub required_fields: Vec<String>,
    /// User-authored fields where the local value wins a timestamp tie
    pub user_fields: Vec<String>,
    /// Upper bound on rows fetched by a partial sync
    pub row_cap: usize,
    /// Priority class of mutations on this table
    pub priority: Priority,
    /// Deletion propagation
    pub delete_policy: DeletePolicy,
    /// Updates on this table affect quotas and are dispatched as critical
    pub quota_affecting: bool,
    /// Remote procedure that commits create/update on this table
    pub commit_rpc: Option<String>,
    /// Remote procedure that returns the full tenant scope, bypassing row caps
    pub full_scope_rpc: Option<String>,
}

impl Default for TablePolicy {
    fn default() -> Self {
        Self {
            name: String::new(),
            required_fields: Vec::new(),
            user_fields: Vec::new(),
            row_cap: 1000,
            priority: Priority::Low,
            delete_policy: DeletePolicy::Remote,
            quota_affecting: false,
            commit_rpc: None,
            full_scope_rpc: None,
        }
    }
}

impl TablePolicy {
    /// Create a policy with defaults for the given table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_user_fields(mut self, fields: &[&str]) -> Self {
        self.user_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_row_cap(mut self, cap: usize) -> Self {
        self.row_cap = cap;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn quota_affecting(mut self) -> Self {
        self.quota_affecting = true;
        self
    }

    pub fn with_commit_rpc(mut self, rpc: impl Into<String>) -> Self {
        self.commit_rpc = Some(rpc.into());
        self
    }

    pub fn with_full_scope_rpc(mut self, rpc: impl Into<String>) -> Self {
        self.full_scope_rpc = Some(rpc.into());
        self
    }
}

/// The default table registry of the contact-management domain
pub fn default_tables() -> Vec<TablePolicy> {
    vec![
        TablePolicy::new("contacts")
            .with_required_fields(&["phone"])
            .with_user_fields(&["notes", "tags", "is_favorite", "is_blocked"])
            .with_row_cap(5000)
            .with_priority(Priority::High)
            .with_full_scope_rpc("pull_all_contacts"),
        TablePolicy::new("templates")
            .with_required_fields(&["name", "content"])
            .with_user_fields(&["notes", "tags"])
            .with_row_cap(1000)
            .with_priority(Priority::High),
        TablePolicy::new("groups")
            .with_required_fields(&["name"])
            .with_user_fields(&["notes"])
            .with_row_cap(2000)
            .with_priority(Priority::Normal),
        TablePolicy::new("message_logs")
            .with_row_cap(2000)
            .with_priority(Priority::Normal),
        TablePolicy::new("assets")
            .with_required_fields(&["file_name"])
            .with_row_cap(200)
            .with_priority(Priority::Low)
            .with_delete_policy(DeletePolicy::Soft),
        TablePolicy::new("quotas")
            .with_row_cap(100)
            .with_priority(Priority::Normal)
            .quota_affecting()
            .with_commit_rpc("commit_quota_reservation"),
    ]
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Owning scope every remote query is filtered by
    pub tenant_id: String,
    /// Base URL of the REST backend
    pub backend_url: String,
    /// API key sent with every request
    pub api_key: Option<String>,
    /// Run cycles on timers and reconnects
    pub auto_sync: bool,
    /// Base interval between cycles while online
    pub sync_interval_secs: u64,
    /// Interval used while the user is idle
    pub background_interval_secs: u64,
    /// Multiplier applied to the base interval while the user is active
    pub active_interval_multiplier: f64,
    /// Lower bound on any computed interval
    pub min_interval_secs: u64,
    /// Local interaction within this window marks the user as active
    pub activity_window_secs: u64,
    /// Interval between latency probes while online
    pub probe_interval_secs: u64,
    /// Timeout of a single latency probe
    pub probe_timeout_ms: u64,
    /// Timeout of data calls against the backend
    pub request_timeout_secs: u64,
    /// Operations pushed per batch
    pub push_batch_size: usize,
    /// Tables pulled concurrently within a cycle
    pub prefetch_concurrency: usize,
    /// Records processed per pull chunk
    pub pull_chunk_size: usize,
    /// Maximum number of pending operations
    pub max_queue_size: usize,
    /// Per-operation retry policy
    pub retry: RetryPolicy,
    /// Default conflict resolution strategy
    pub conflict_strategy: ConflictStrategy,
    /// A pending local change older than the remote by more than this is stale
    pub staleness_threshold_secs: i64,
    /// Clock skew above which a resolution notifies the user
    pub skew_notification_secs: i64,
    /// Coalescing window for critical-operation triggers
    pub critical_debounce_ms: u64,
    /// Consecutive cycle failures before the engine gives up
    pub max_cycle_failures: u32,
    /// Base delay before retrying a failed cycle
    pub cycle_backoff_base_secs: u64,
    /// Retention of completed operations
    pub completed_retention_secs: i64,
    /// Retention of failed operations
    pub failed_retention_secs: i64,
    /// Retention of synced tombstones
    pub tombstone_retention_secs: i64,
    /// Interval of the cleanup scheduler
    pub cleanup_interval_secs: u64,
    /// Syncable tables
    pub tables: Vec<TablePolicy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            backend_url: String::new(),
            api_key: None,
            auto_sync: true,
            sync_interval_secs: 30,
            background_interval_secs: 300,
            active_interval_multiplier: 0.5,
            min_interval_secs: 5,
            activity_window_secs: 120,
            probe_interval_secs: 60,
            probe_timeout_ms: 3000,
            request_timeout_secs: 30,
            push_batch_size: 50,
            prefetch_concurrency: 3,
            pull_chunk_size: 100,
            max_queue_size: 10_000,
            retry: RetryPolicy::default(),
            conflict_strategy: ConflictStrategy::LastWriteWins,
            staleness_threshold_secs: 300,
            skew_notification_secs: 300,
            critical_debounce_ms: 2000,
            max_cycle_failures: 3,
            cycle_backoff_base_secs: 5,
            completed_retention_secs: 24 * 3600,
            failed_retention_secs: 7 * 24 * 3600,
            tombstone_retention_secs: 30 * 24 * 3600,
            cleanup_interval_secs: 3600,
            tables: default_tables(),
        }
    }
}

impl SyncConfig {
    /// Create a new SyncConfigBuilder
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Overlay `SYNC_*` environment variables
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("SYNC_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Ok(key) = std::env::var("SYNC_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(tenant) = std::env::var("SYNC_TENANT_ID") {
            self.tenant_id = tenant;
        }
        if let Ok(flag) = std::env::var("SYNC_AUTO_SYNC") {
            self.auto_sync = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(secs) = std::env::var("SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = secs
                .parse()
                .map_err(|_| ConfigError::invalid("sync_interval_secs", "not an integer"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ConfigError::MissingValue("tenant_id"));
        }
        if !self.backend_url.is_empty() {
            reqwest::Url::parse(&self.backend_url)
                .map_err(|_| ConfigError::InvalidUrl(self.backend_url.clone()))?;
        }
        if self.push_batch_size == 0 {
            return Err(ConfigError::invalid("push_batch_size", "must be positive"));
        }
        if self.prefetch_concurrency == 0 {
            return Err(ConfigError::invalid("prefetch_concurrency", "must be positive"));
        }
        if self.pull_chunk_size == 0 {
            return Err(ConfigError::invalid("pull_chunk_size", "must be positive"));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::invalid("max_queue_size", "must be positive"));
        }
        if self.tombstone_retention_secs < 0 {
            return Err(ConfigError::invalid("tombstone_retention_secs", "must not be negative"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.active_interval_multiplier <= 0.0 {
            return Err(ConfigError::invalid(
                "active_interval_multiplier",
                "must be positive",
            ));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(ConfigError::invalid("tables", "table name is empty"));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(ConfigError::invalid(
                    "tables",
                    format!("duplicate table {}", table.name),
                ));
            }
        }
        Ok(())
    }

    /// Policy of a table, if it is syncable
    pub fn table(&self, name: &str) -> Option<&TablePolicy> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Names of every syncable table
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Table policies indexed by name
    pub fn table_map(&self) -> HashMap<String, TablePolicy> {
        self.tables
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn critical_debounce(&self) -> Duration {
        Duration::from_millis(self.critical_debounce_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_threshold_secs)
    }

    pub fn skew_notification_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.skew_notification_secs)
    }
}

/// Builder for SyncConfig
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn tenant_id(mut self, tenant: impl Into<String>) -> Self {
        self.config.tenant_id = tenant.into();
        self
    }

    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync_interval_secs = secs;
        self
    }

    pub fn background_interval_secs(mut self, secs: u64) -> Self {
        self.config.background_interval_secs = secs;
        self
    }

    pub fn push_batch_size(mut self, size: usize) -> Self {
        self.config.push_batch_size = size;
        self
    }

    pub fn pull_chunk_size(mut self, size: usize) -> Self {
        self.config.pull_chunk_size = size;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.config.conflict_strategy = strategy;
        self
    }

    pub fn critical_debounce_ms(mut self, ms: u64) -> Self {
        self.config.critical_debounce_ms = ms;
        self
    }

    pub fn cycle_backoff_base_secs(mut self, secs: u64) -> Self {
        self.config.cycle_backoff_base_secs = secs;
        self
    }

    pub fn max_cycle_failures(mut self, failures: u32) -> Self {
        self.config.max_cycle_failures = failures;
        self
    }

    pub fn tombstone_retention_secs(mut self, secs: i64) -> Self {
        self.config.tombstone_retention_secs = secs;
        self
    }

    pub fn staleness_threshold_secs(mut self, secs: i64) -> Self {
        self.config.staleness_threshold_secs = secs;
        self
    }

    /// Replace the table registry
    pub fn tables(mut self, tables: Vec<TablePolicy>) -> Self {
        self.config.tables = tables;
        self
    }

    /// Add or replace one table policy
    pub fn table(mut self, policy: TablePolicy) -> Self {
        self.config.tables.retain(|t| t.name != policy.name);
        self.config.tables.push(policy);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("failed to read configuration: {0}")]
    Io(String),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
