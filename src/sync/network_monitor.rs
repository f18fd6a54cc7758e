//! # Network Monitor
//!
//! Tracks connectivity, probe latency and user activity.
//!
//! ## Features
//!
//! - **Connectivity Edges**: online/offline changes are reported once per transition
//! - **Connection Quality**: latency classes from a rolling window of probes
//! - **User Activity**: recent local interaction shortens the sync interval

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::remote::RemoteBackend;
use crate::shared::error::SyncError;
use crate::sync::sync_state::{ConnectionQuality, ConnectionState};

/// Probes kept for the latency average
pub const PROBE_HISTORY: usize = 10;

const EXCELLENT_LATENCY_MS: f64 = 500.0;
const GOOD_LATENCY_MS: f64 = 2000.0;
/// Failures in a row beyond which the connection counts as poor
const POOR_AFTER_FAILURES: u32 = 3;

/// Edge of the online flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    WentOnline,
    WentOffline,
}

/// Classify a connection from its average latency and failure streak
pub fn classify(average_latency_ms: Option<f64>, consecutive_failures: u32) -> ConnectionQuality {
    if consecutive_failures > POOR_AFTER_FAILURES {
        return ConnectionQuality::Poor;
    }
    match average_latency_ms {
        Some(ms) if ms < EXCELLENT_LATENCY_MS => ConnectionQuality::Excellent,
        Some(ms) if ms < GOOD_LATENCY_MS => ConnectionQuality::Good,
        Some(_) => ConnectionQuality::Poor,
        None => ConnectionQuality::Good,
    }
}

#[derive(Debug)]
struct MonitorState {
    connection: ConnectionState,
    samples: VecDeque<f64>,
    last_activity: Option<Instant>,
}

/// Connection and activity monitor
#[derive(Debug)]
pub struct NetworkMonitor {
    state: RwLock<MonitorState>,
    activity_window: Duration,
}

impl NetworkMonitor {
    pub fn new(is_online: bool, activity_window: Duration) -> Self {
        Self {
            state: RwLock::new(MonitorState {
                connection: ConnectionState::new(is_online),
                samples: VecDeque::with_capacity(PROBE_HISTORY),
                last_activity: None,
            }),
            activity_window,
        }
    }

    /// Connection snapshot
    pub async fn connection(&self) -> ConnectionState {
        self.state.read().await.connection.clone()
    }

    pub async fn is_online(&self) -> bool {
        self.state.read().await.connection.is_online
    }

    /// Set the online flag; returns the edge when it changed
    pub async fn set_online(&self, online: bool) -> Option<ConnectivityChange> {
        let mut state = self.state.write().await;
        if state.connection.is_online == online {
            return None;
        }

        state.connection.is_online = online;
        state.connection.consecutive_failures = 0;
        if online {
            state.connection.quality =
                classify(state.connection.average_latency_ms, 0);
            tracing::info!("[Monitor] Connection restored");
            Some(ConnectivityChange::WentOnline)
        } else {
            state.connection.quality = ConnectionQuality::Offline;
            tracing::warn!("[Monitor] Connection lost");
            Some(ConnectivityChange::WentOffline)
        }
    }

    /// Record a successful probe
    pub async fn record_probe_success(&self, latency: Duration) -> ConnectionQuality {
        let mut state = self.state.write().await;
        if state.samples.len() == PROBE_HISTORY {
            state.samples.pop_front();
        }
        state.samples.push_back(latency.as_secs_f64() * 1000.0);
        let average = state.samples.iter().sum::<f64>() / state.samples.len() as f64;

        state.connection.average_latency_ms = Some(average);
        state.connection.consecutive_failures = 0;
        state.connection.last_probe = Some(Utc::now());
        if state.connection.is_online {
            state.connection.quality = classify(Some(average), 0);
        }
        state.connection.quality
    }

    /// Record a failed probe
    pub async fn record_probe_failure(&self) -> ConnectionQuality {
        let mut state = self.state.write().await;
        state.connection.consecutive_failures += 1;
        state.connection.last_probe = Some(Utc::now());
        if state.connection.is_online {
            state.connection.quality = classify(
                state.connection.average_latency_ms,
                state.connection.consecutive_failures,
            );
        }
        state.connection.quality
    }

    /// Measure one round trip against the backend
    pub async fn probe(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        timeout: Duration,
    ) -> Result<Duration, SyncError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, backend.ping()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::network(format!("probe timed out after {:?}", timeout))),
        };

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                let quality = self.record_probe_success(latency).await;
                tracing::debug!("[Monitor] Probe took {:?} ({:?})", latency, quality);
                Ok(latency)
            }
            Err(e) => {
                let quality = self.record_probe_failure().await;
                tracing::debug!("[Monitor] Probe failed ({:?}): {}", quality, e);
                Err(e)
            }
        }
    }

    /// Note a local interaction
    pub async fn record_activity(&self) {
        self.state.write().await.last_activity = Some(Instant::now());
    }

    /// Whether the user interacted within the activity window
    pub async fn is_user_active(&self) -> bool {
        self.state
            .read()
            .await
            .last_activity
            .map(|at| at.elapsed() <= self.activity_window)
            .unwrap_or(false)
    }
}
