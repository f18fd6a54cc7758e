// Increase recursion limit for complex async operations
#![recursion_limit = "256"]

//! Offline Sync - Main Library
//!
//! An offline-first synchronization engine. It keeps an embedded local store
//! consistent with a remote backend under unreliable connectivity, while the
//! local store stays readable and writable at all times.
//!
//! # Overview
//!
//! - Durable, priority-ordered queue of local mutations
//! - Push with per-operation retry and exponential backoff
//! - Incremental pull with per-table checkpoints and conflict resolution
//! - Partial sync of large tables with background completion
//! - Connection monitoring and an adaptive sync interval
//!
//! # Module Structure
//!
//! - **`shared`** - Error taxonomy, timestamps, configuration and events
//! - **`local_db`** - SQLite local store: records, queue and checkpoints
//! - **`offline`** - Sync queue, retry policy and optimistic local apply
//! - **`remote`** - Backend trait and the REST client
//! - **`sync`** - Push and pull engines and the `SyncEngine` orchestrator
//!
//! # Usage
//!
//! ```rust,no_run
//! use offline_sync::local_db::LocalDatabase;
//! use offline_sync::remote::HttpBackend;
//! use offline_sync::shared::SyncConfig;
//! use offline_sync::sync::SyncEngine;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::builder()
//!     .tenant_id("tenant-1")
//!     .backend_url("https://example.supabase.co")
//!     .build()?;
//! let db = Arc::new(LocalDatabase::in_memory().await?);
//! let backend = Arc::new(HttpBackend::from_config(&config)?);
//!
//! let engine = SyncEngine::new(config, db, backend)?;
//! engine.add_event_listener(|event| println!("{:?}", event));
//! engine.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! `SyncEngine` is cheap to clone and every clone shares the same state. The
//! local store may be read from outside the engine at any time; records are
//! only ever replaced wholesale.
//!
//! # Error Handling
//!
//! Every fallible operation returns `Result<T, SyncError>`; see
//! `shared::error` for the taxonomy.

/// Shared types and data structures
pub mod shared;

/// SQLite local store
pub mod local_db;

/// Offline queue and local apply
pub mod offline;

/// Remote backend access
pub mod remote;

/// Synchronization engine
pub mod sync;

pub use shared::{SyncConfig, SyncError, SyncEvent};
pub use sync::SyncEngine;
