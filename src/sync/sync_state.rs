//! # Sync State Management
//!
//! Status and connection snapshots exposed by the engine.
//!
//! ## Features
//!
//! - **Engine Status**: idle, syncing, offline, reconnecting or error
//! - **Connection State**: online flag, quality class, failures and latency
//! - **Status Snapshot**: everything `get_status` reports in one value

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Global engine status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Online, no cycle running
    #[default]
    Idle,
    /// A cycle is running
    Syncing,
    /// No connectivity; scheduled cycles are halted
    Offline,
    /// The last cycle failed; a retry is scheduled
    Reconnecting,
    /// Gave up after repeated failures or lost credentials; needs a retrigger
    Error,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Syncing => "syncing",
            EngineStatus::Offline => "offline",
            EngineStatus::Reconnecting => "reconnecting",
            EngineStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Latency-based connection quality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Round trips under 500ms
    Excellent,
    /// Round trips under 2s
    Good,
    /// Slow or repeatedly failing
    Poor,
    /// No network connection
    Offline,
}

/// Connectivity snapshot, mutated only by the connection monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_online: bool,
    pub quality: ConnectionQuality,
    /// Probes failed in a row
    pub consecutive_failures: u32,
    /// Rolling average of recent successful probes
    pub average_latency_ms: Option<f64>,
    pub last_probe: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// Initial state for a known connectivity
    pub fn new(is_online: bool) -> Self {
        Self {
            is_online,
            quality: if is_online {
                ConnectionQuality::Good
            } else {
                ConnectionQuality::Offline
            },
            consecutive_failures: 0,
            average_latency_ms: None,
            last_probe: None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Status snapshot returned by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: EngineStatus,
    /// Whether a cycle is currently running
    pub is_syncing: bool,
    /// Completion time of the last successful cycle
    pub last_sync: Option<DateTime<Utc>>,
    /// Number of pending operations
    pub pending_operations: u64,
    /// Number of failed operations
    pub failed_operations: u64,
    /// Cycles failed in a row
    pub consecutive_failures: u32,
    pub connection: ConnectionState,
    /// Interval between scheduled cycles
    pub current_interval: Duration,
    /// Time left until the next scheduled cycle, once one has completed
    pub next_sync_in: Option<Duration>,
    /// The queue is over capacity with only critical work in it
    pub queue_overflow: bool,
    /// Message of the last cycle-level error
    pub last_error: Option<String>,
}
