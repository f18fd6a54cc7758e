//! # Sync Scheduler
//!
//! Computes the delay between periodic sync cycles from user activity and
//! connection quality.
//!
//! ## Rules
//!
//! - **Active User**: base interval times the active multiplier
//! - **Idle User**: the longer background interval
//! - **Poor Connection**: doubles the chosen interval
//! - **Excellent Connection**: shortens it by 20%
//!
//! The result never drops below the configured minimum. The engine reschedules
//! its timer whenever the computed interval changes.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::shared::config::SyncConfig;
use crate::sync::sync_state::ConnectionQuality;

/// Interval inputs taken from the configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalPolicy {
    pub base: Duration,
    pub background: Duration,
    pub active_multiplier: f64,
    pub min: Duration,
}

impl IntervalPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: config.sync_interval(),
            background: config.background_interval(),
            active_multiplier: config.active_interval_multiplier,
            min: config.min_interval(),
        }
    }

    /// Interval for the given conditions
    pub fn compute(&self, user_active: bool, quality: ConnectionQuality) -> Duration {
        let mut interval = if user_active {
            self.base.mul_f64(self.active_multiplier)
        } else {
            self.background
        };

        interval = match quality {
            ConnectionQuality::Excellent => interval.mul_f64(0.8),
            ConnectionQuality::Poor => interval * 2,
            ConnectionQuality::Good | ConnectionQuality::Offline => interval,
        };

        interval.max(self.min)
    }
}

/// Synchronization scheduler
#[derive(Debug)]
pub struct SyncScheduler {
    policy: IntervalPolicy,
    /// Current sync interval
    current_interval: RwLock<Duration>,
    /// Last completed cycle
    last_sync: RwLock<Option<Instant>>,
}

impl SyncScheduler {
    /// Create a new sync scheduler
    pub fn new(policy: IntervalPolicy) -> Self {
        Self {
            current_interval: RwLock::new(policy.base.max(policy.min)),
            policy,
            last_sync: RwLock::new(None),
        }
    }

    pub async fn current_interval(&self) -> Duration {
        *self.current_interval.read().await
    }

    /// Recompute the interval; returns it when it changed
    pub async fn update(&self, user_active: bool, quality: ConnectionQuality) -> Option<Duration> {
        let next = self.policy.compute(user_active, quality);
        let mut current = self.current_interval.write().await;
        if *current == next {
            return None;
        }
        tracing::debug!(
            "[Engine] Sync interval {:?} -> {:?} (active: {}, {:?})",
            *current,
            next,
            user_active,
            quality
        );
        *current = next;
        Some(next)
    }

    /// Record a completed cycle
    pub async fn record_sync(&self) {
        *self.last_sync.write().await = Some(Instant::now());
    }

    /// Time left until the next cycle is due, once one has completed
    pub async fn time_until_next_sync(&self) -> Option<Duration> {
        let last_sync = (*self.last_sync.read().await)?;
        let interval = *self.current_interval.read().await;
        Some(interval.saturating_sub(last_sync.elapsed()))
    }
}
