//! # Sync Metrics
//!
//! Cumulative counters for observability. They only grow, except through
//! an explicit [`SyncMetrics::reset`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sync::sync_state::ConnectionQuality;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// Operations pushed, successful or not
    pub total_operations: u64,
    pub succeeded_operations: u64,
    pub failed_operations: u64,
    /// Remote records applied locally
    pub records_pulled: u64,
    pub conflicts_resolved: u64,
    pub average_sync_duration: Duration,
    pub last_sync_duration: Option<Duration>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub connection_quality: Option<ConnectionQuality>,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            total_syncs: 0,
            successful_syncs: 0,
            failed_syncs: 0,
            total_operations: 0,
            succeeded_operations: 0,
            failed_operations: 0,
            records_pulled: 0,
            conflicts_resolved: 0,
            average_sync_duration: Duration::ZERO,
            last_sync_duration: None,
            last_sync_time: None,
            connection_quality: None,
        }
    }

    pub fn record_sync_start(&mut self) {
        self.total_syncs += 1;
    }

    pub fn record_sync_success(&mut self, duration: Duration) {
        self.successful_syncs += 1;
        self.last_sync_duration = Some(duration);
        self.last_sync_time = Some(Utc::now());

        // Update rolling average
        let total = self.average_sync_duration * (self.successful_syncs - 1) as u32 + duration;
        self.average_sync_duration = total / self.successful_syncs as u32;
    }

    pub fn record_sync_failure(&mut self) {
        self.failed_syncs += 1;
    }

    pub fn record_operations(&mut self, succeeded: u64, failed: u64) {
        self.total_operations += succeeded + failed;
        self.succeeded_operations += succeeded;
        self.failed_operations += failed;
    }

    pub fn record_pull(&mut self, applied: u64, conflicts: u64) {
        self.records_pulled += applied;
        self.conflicts_resolved += conflicts;
    }

    /// Administrative reset; the connection quality is kept
    pub fn reset(&mut self) {
        let quality = self.connection_quality;
        *self = Self::new();
        self.connection_quality = quality;
    }
}
