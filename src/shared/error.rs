//! # Sync Error Types
//!
//! Error taxonomy shared by every component of the synchronization engine.
//!
//! ## Error Categories
//!
//! - `Validation` - malformed payload, the operation is never queued
//! - `Network` - recoverable transport failures, drive retry and backoff
//! - `Conflict` - never fatal, always resolved or downgraded to manual review
//! - `QuotaOrBusinessRule` - rejections from RPC-style calls, retried at most once
//! - `QueueOverflow` - the queue is full and nothing may be evicted
//!
//! The remaining variants describe authentication loss, storage failures and
//! engine lifecycle problems.
//!
//! ## Usage
//!
//! ```rust
//! use offline_sync::shared::error::SyncError;
//!
//! let error = SyncError::classify("connection reset by peer");
//! assert!(error.is_network());
//! ```
//!
//! All variants are `Clone` so that a single in-flight sync result can be
//! handed to every caller awaiting it.
use thiserror::Error;

/// Message fragments that identify a transport-level failure.
const NETWORK_SIGNATURES: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "connection aborted",
    "failed to fetch",
    "error sending request",
    "dns error",
    "no route to host",
    "host unreachable",
    "broken pipe",
    "econnrefused",
    "econnreset",
    "etimedout",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
];

/// Errors raised by the synchronization engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Payload or record failed validation
    #[error("Validation error in {table}.{field}: {message}")]
    Validation {
        /// Table the payload belongs to
        table: String,
        /// Offending field
        field: String,
        /// Human-readable error message
        message: String,
    },

    /// Recoverable transport failure
    #[error("Network error: {message}")]
    Network {
        /// Human-readable error message
        message: String,
    },

    /// Conflict that could not be settled automatically
    #[error("Conflict on {table}/{record_id}: {message}")]
    Conflict {
        /// Table of the conflicting record
        table: String,
        /// Conflicting record id
        record_id: String,
        /// Human-readable error message
        message: String,
    },

    /// Rejection from a remote procedure (quota exhausted, rule violated)
    #[error("Business rule rejected the operation: {message}")]
    QuotaOrBusinessRule {
        /// Human-readable error message
        message: String,
    },

    /// The queue is full and the operation could not be admitted
    #[error("Sync queue overflow: {message}")]
    QueueOverflow {
        /// Human-readable error message
        message: String,
    },

    /// Credentials were rejected by the backend
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Human-readable error message
        message: String,
    },

    /// Non-transport error reported by the backend
    #[error("Backend error ({status}): {message}")]
    Backend {
        /// HTTP status, 0 when unknown
        status: u16,
        /// Human-readable error message
        message: String,
    },

    /// Local store failure
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message
        message: String,
    },

    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
    },

    /// The engine is offline and cannot reach the backend
    #[error("Engine is offline")]
    Offline,

    /// The engine was destroyed
    #[error("Engine has been destroyed")]
    Destroyed,

    /// Unexpected internal failure (task panics, lost channels)
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message
        message: String,
    },
}

impl SyncError {
    /// Create a new validation error
    pub fn validation(
        table: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            table: table.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new business rule error
    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::QuotaOrBusinessRule {
            message: message.into(),
        }
    }

    /// Create a new queue overflow error
    pub fn queue_overflow(message: impl Into<String>) -> Self {
        Self::QueueOverflow {
            message: message.into(),
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a free-form failure message onto the taxonomy.
    ///
    /// Messages matching a known network-failure signature become `Network`,
    /// everything else is reported as a `Backend` error with an unknown status.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_network_message(&message) {
            Self::Network { message }
        } else {
            Self::Backend { status: 0, message }
        }
    }

    /// Map an HTTP status and response body onto the taxonomy
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Unauthorized { message: body },
            408 | 429 | 500..=599 => Self::Network {
                message: format!("HTTP {}: {}", status, body),
            },
            _ => Self::Backend {
                status,
                message: body,
            },
        }
    }

    /// Whether this is a recoverable transport failure
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Storage { .. } | Self::QuotaOrBusinessRule { .. } => true,
            Self::Backend { status, .. } => *status == 0 || *status >= 500,
            _ => false,
        }
    }

    /// Number of retries this error class is entitled to under `max_retries`.
    pub fn retry_budget(&self, max_retries: u32) -> u32 {
        match self {
            Self::QuotaOrBusinessRule { .. } => max_retries.min(1),
            e if e.is_retryable() => max_retries,
            _ => 0,
        }
    }
}

/// Whether a message carries one of the known network-failure signatures
pub fn is_network_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    NETWORK_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::network(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        Self::classify(err.to_string())
    }
}
