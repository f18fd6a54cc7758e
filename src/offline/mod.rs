//! # Offline Support
//!
//! Everything that lets the application keep writing while disconnected.
//!
//! ## Key Components
//!
//! - `queue.rs`: the durable, prioritized sync queue
//! - `retry.rs`: retry policy and exponential backoff
//! - `optimistic.rs`: immediate local apply of queued mutations

pub mod optimistic;
pub mod queue;
pub mod retry;

// Re-export main types
pub use optimistic::{apply_local, stamp_payload};
pub use queue::{
    EnqueueReceipt, OperationKind, OperationStatus, PrioritizedOperation, Priority, QueueStats,
    SyncOperation, SyncQueue,
};
pub use retry::{RetryPolicy, RetryReport};
