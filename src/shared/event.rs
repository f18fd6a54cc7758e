//! # Sync Events
//!
//! Events emitted by the engine for UI and diagnostics, and the bus that
//! delivers them.
//!
//! Delivery happens two ways:
//!
//! - **Listeners**: callbacks registered with [`EventBus::add_listener`]. Each
//!   listener is invoked in isolation, so a panicking listener never prevents
//!   the remaining listeners from receiving the event.
//! - **Channel**: a bounded `tokio::sync::broadcast` channel obtained with
//!   [`EventBus::subscribe`]. Slow receivers lag and drop old events rather
//!   than blocking the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::sync::sync_state::EngineStatus;

/// Capacity of the broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Event emitted by the synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A sync cycle started
    SyncStart,
    /// Progress within the current cycle
    ProgressUpdate {
        current: usize,
        total: usize,
    },
    /// A sync cycle finished successfully
    SyncComplete {
        pushed: usize,
        failed: usize,
        pulled: usize,
        duration_ms: u64,
    },
    /// A sync cycle failed
    SyncError {
        error: String,
    },
    /// The engine status changed
    StatusChange {
        status: EngineStatus,
    },
    /// A conflict between a local and remote record was detected
    ConflictDetected {
        table: String,
        record_id: String,
        resolution: String,
    },
    /// A message meant for the user
    UserNotification {
        message: String,
        severity: Severity,
    },
}

impl SyncEvent {
    /// Short name of the event kind, matching the serialized tag
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart => "sync_start",
            SyncEvent::ProgressUpdate { .. } => "progress_update",
            SyncEvent::SyncComplete { .. } => "sync_complete",
            SyncEvent::SyncError { .. } => "sync_error",
            SyncEvent::StatusChange { .. } => "status_change",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::UserNotification { .. } => "user_notification",
        }
    }

    /// Build a user notification event
    pub fn notification(message: impl Into<String>, severity: Severity) -> Self {
        SyncEvent::UserNotification {
            message: message.into(),
            severity,
        }
    }
}

/// Callback invoked for every emitted event
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Publish/subscribe bus for [`SyncEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EventBusInner {
                sender,
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener callback
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Remove every listener
    pub fn clear_listeners(&self) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Subscribe to the broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sender.subscribe()
    }

    /// Deliver an event to every listener and channel subscriber
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so listeners may (un)register from inside a callback.
        let listeners: Vec<(ListenerId, EventListener)> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!("[Events] Listener {:?} panicked on {}", id, event.kind());
            }
        }

        // No receivers is not an error.
        let _ = self.inner.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}
