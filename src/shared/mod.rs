//! Shared Module
//!
//! Types used by every component of the engine: the error taxonomy,
//! timestamp normalization, configuration and the event bus.

/// Error taxonomy
pub mod error;

/// Emitted events and the pub/sub bus
pub mod event;

/// Timestamp normalization and record validation
pub mod timestamp;

/// Engine configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use config::{ConfigError, DeletePolicy, SyncConfig, SyncConfigBuilder, TablePolicy};
pub use error::SyncError;
pub use event::{EventBus, ListenerId, Severity, SyncEvent};
