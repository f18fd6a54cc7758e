//! # Sync Engine
//!
//! The orchestrator of offline-first synchronization. It owns the engine
//! state and is the single caller of the queue, the push and pull engines,
//! the connection monitor and the scheduler.
//!
//! ## Architecture
//!
//! - **Push Engine**: drains the durable queue in priority order with retries
//! - **Pull Engine**: fetches remote changes per table and resolves conflicts
//! - **Partial Sync**: recent slices first, the remainder in the background
//! - **Network Monitor**: connectivity edges, probe latency and user activity
//! - **Scheduler**: adaptive interval between periodic cycles
//! - **Sync State / Metrics**: status snapshot and cumulative counters
//!
//! A cycle pushes first, then pulls the tables, `prefetch_concurrency` at a
//! time. Concurrent
//! triggers share the cycle already in flight instead of starting a second
//! one.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offline_sync::local_db::LocalDatabase;
//! use offline_sync::offline::OperationKind;
//! use offline_sync::remote::HttpBackend;
//! use offline_sync::shared::SyncConfig;
//! use offline_sync::sync::SyncEngine;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::builder()
//!     .tenant_id("tenant-1")
//!     .backend_url("https://example.supabase.co")
//!     .build()?;
//! let db = Arc::new(LocalDatabase::open(LocalDatabase::default_path()).await?);
//! let backend = Arc::new(HttpBackend::from_config(&config)?);
//!
//! let engine = SyncEngine::new(config, db, backend)?;
//! engine.start()?;
//!
//! engine
//!     .enqueue("contacts", OperationKind::Create, "c-1", json!({"phone": "+100"}), None)
//!     .await?;
//! let report = engine.trigger_sync().await?;
//! println!("pushed {}", report.push.succeeded);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod conflict_resolver;
pub mod metrics;
pub mod network_monitor;
pub mod partial;
pub mod pull;
pub mod push;
pub mod scheduler;
pub mod sync_state;

pub use checkpoint::CheckpointStore;
pub use conflict_resolver::{ConflictState, ConflictStrategy, Resolution};
pub use metrics::SyncMetrics;
pub use network_monitor::{ConnectivityChange, NetworkMonitor};
pub use pull::{ApplyStats, PullEngine, PullOptions, PullOutcome, PullStatus};
pub use push::{OperationOutcome, PushEngine, PushSummary};
pub use scheduler::{IntervalPolicy, SyncScheduler};
pub use sync_state::{ConnectionQuality, ConnectionState, EngineStatus, SyncState};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, Shared};
use futures_util::{stream, FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle};

use crate::local_db::{LocalDatabase, LocalStore, QueueStore, SettingsStore};
use crate::offline::optimistic::apply_local;
use crate::offline::queue::{EnqueueReceipt, OperationKind, Priority, QueueStats, SyncOperation, SyncQueue};
use crate::remote::RemoteBackend;
use crate::shared::config::SyncConfig;
use crate::shared::error::SyncError;
use crate::shared::event::{EventBus, ListenerId, Severity, SyncEvent};

type CycleFuture = Shared<BoxFuture<'static, Result<CycleReport, SyncError>>>;

/// Result of one sync cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub push: PushSummary,
    pub pulls: Vec<PullOutcome>,
    pub duration: Duration,
}

impl CycleReport {
    /// Remote records written locally
    pub fn pulled(&self) -> usize {
        self.pulls.iter().map(|p| p.stats.written()).sum()
    }
}

/// Statistics returned by [`SyncEngine::get_sync_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub metrics: SyncMetrics,
    pub queue: QueueStats,
    pub connection: ConnectionState,
}

#[derive(Debug, Default)]
struct EngineState {
    status: EngineStatus,
    last_sync: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    queue_overflow: bool,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Tasks {
    periodic: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    critical: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.periodic.take(),
            self.probe.take(),
            self.cleanup.take(),
            self.retry.take(),
            self.critical.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

fn replace_task(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
    if let Some(old) = slot.replace(task) {
        old.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InFlight {
    generation: u64,
    future: CycleFuture,
    abort: AbortHandle,
}

struct EngineInner {
    config: Arc<SyncConfig>,
    queue: Arc<SyncQueue>,
    store: Arc<dyn LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    events: EventBus,
    push: PushEngine,
    pull: PullEngine,
    monitor: NetworkMonitor,
    scheduler: SyncScheduler,
    state: RwLock<EngineState>,
    metrics: RwLock<SyncMetrics>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
    tasks: Mutex<Tasks>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

/// Offline-first synchronization engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tenant_id", &self.inner.config.tenant_id)
            .field("destroyed", &self.inner.destroyed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine over a SQLite store
    pub fn new(
        config: SyncConfig,
        db: Arc<LocalDatabase>,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<Self, SyncError> {
        Self::with_stores(config, db.clone(), db.clone(), db, backend)
    }

    /// Create an engine over arbitrary store implementations
    pub fn with_stores(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        queue_store: Arc<dyn QueueStore>,
        settings: Arc<dyn SettingsStore>,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<Self, SyncError> {
        config
            .validate()
            .map_err(|e| SyncError::validation("<config>", "config", e.to_string()))?;

        let config = Arc::new(config);
        let events = EventBus::new();
        let queue = Arc::new(SyncQueue::new(queue_store, &config));

        let push = PushEngine::new(push::PushContext {
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            backend: Arc::clone(&backend),
            events: events.clone(),
            config: Arc::clone(&config),
        });
        let pull = PullEngine::new(pull::PullContext {
            store: Arc::clone(&store),
            backend: Arc::clone(&backend),
            checkpoints: CheckpointStore::new(settings),
            events: events.clone(),
            config: Arc::clone(&config),
        });

        let inner = EngineInner {
            monitor: NetworkMonitor::new(true, config.activity_window()),
            scheduler: SyncScheduler::new(IntervalPolicy::from_config(&config)),
            config,
            queue,
            store,
            backend,
            events,
            push,
            pull,
            state: RwLock::new(EngineState::default()),
            metrics: RwLock::new(SyncMetrics::new()),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Tasks::default()),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start the background schedulers.
    ///
    /// The probe and cleanup loops always run; the periodic sync timer and
    /// the initial cycle only with `auto_sync`.
    pub fn start(&self) -> Result<(), SyncError> {
        self.inner.ensure_alive()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(
            "[Engine] Starting for tenant {} ({} tables, auto sync: {})",
            self.inner.config.tenant_id,
            self.inner.config.tables.len(),
            self.inner.config.auto_sync
        );

        self.inner.spawn_probe_loop();
        self.inner.spawn_cleanup_loop();
        if self.inner.config.auto_sync {
            self.inner.spawn_periodic();
            self.inner.spawn_trigger();
        }
        Ok(())
    }

    /// Validate, persist and locally apply a mutation.
    ///
    /// Never waits on the network. When the local write fails the operation
    /// is withdrawn from the queue and the error returned. A critical
    /// operation schedules a debounced out-of-band cycle.
    pub async fn enqueue(
        &self,
        table: &str,
        kind: OperationKind,
        record_id: &str,
        payload: Value,
        priority: Option<Priority>,
    ) -> Result<EnqueueReceipt, SyncError> {
        self.inner.ensure_alive()?;
        self.inner.enqueue(table, kind, record_id, payload, priority).await
    }

    /// Run a sync cycle, or join the one already running
    pub async fn trigger_sync(&self) -> Result<CycleReport, SyncError> {
        self.inner.trigger().await
    }

    /// Pull one table outside of a cycle
    pub async fn pull_table(&self, table: &str, options: PullOptions) -> Result<PullOutcome, SyncError> {
        self.inner.ensure_alive()?;
        self.inner.ensure_online().await?;
        self.inner.pull.pull_table(table, options).await
    }

    /// Pull a recent slice of each table, then complete them in the background
    pub async fn partial_sync(
        &self,
        tables: &[String],
        percentage: f64,
    ) -> Result<Vec<PullOutcome>, SyncError> {
        self.inner.ensure_alive()?;
        self.inner.ensure_online().await?;
        self.inner.pull.partial_sync(tables, percentage).await
    }

    /// Start a non-blocking full pull of `tables`
    pub fn background_sync(&self, tables: Vec<String>) -> Result<(), SyncError> {
        self.inner.ensure_alive()?;
        self.inner.pull.background_sync(tables);
        Ok(())
    }

    /// Await every background pull started so far
    pub async fn wait_for_background(&self) {
        self.inner.pull.wait_for_background().await;
    }

    /// Status snapshot
    pub async fn get_status(&self) -> Result<SyncState, SyncError> {
        let queue = self.inner.queue.stats().await?;
        let connection = self.inner.monitor.connection().await;
        let current_interval = self.inner.scheduler.current_interval().await;
        let next_sync_in = self.inner.scheduler.time_until_next_sync().await;
        let is_syncing = lock(&self.inner.in_flight).is_some();
        let state = self.inner.state.read().await;

        Ok(SyncState {
            status: state.status,
            is_syncing,
            last_sync: state.last_sync,
            pending_operations: queue.pending,
            failed_operations: queue.failed,
            consecutive_failures: state.consecutive_failures,
            connection,
            current_interval,
            next_sync_in,
            queue_overflow: state.queue_overflow,
            last_error: state.last_error.clone(),
        })
    }

    /// Metrics, queue counts and connection state
    pub async fn get_sync_stats(&self) -> Result<SyncStats, SyncError> {
        Ok(SyncStats {
            metrics: self.inner.metrics.read().await.clone(),
            queue: self.inner.queue.stats().await?,
            connection: self.inner.monitor.connection().await,
        })
    }

    /// Register an event listener
    pub fn add_event_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    /// Receive events through a broadcast channel
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Reset the cumulative metrics
    pub async fn reset_metrics(&self) {
        self.inner.metrics.write().await.reset();
        tracing::info!("[Engine] Metrics reset");
    }

    /// Operations that exhausted their retries
    pub async fn failed_operations(&self) -> Result<Vec<SyncOperation>, SyncError> {
        self.inner.queue.failed_operations().await
    }

    /// Drop synced tombstones older than the tombstone retention; pending
    /// deletions are kept until they are pushed
    pub async fn purge_tombstones(&self) -> Result<u64, SyncError> {
        self.inner.ensure_alive()?;
        self.inner.purge_tombstones().await
    }

    /// Re-arm failed operations for the next cycle
    pub async fn retry_failed(&self) -> Result<usize, SyncError> {
        self.inner.ensure_alive()?;
        self.inner.queue.retry_failed().await
    }

    /// Note a local interaction; may shorten the sync interval
    pub async fn record_activity(&self) {
        self.inner.monitor.record_activity().await;
        self.inner.refresh_interval().await;
    }

    /// Report a connectivity change from the host platform
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.inner.ensure_alive()?;
        self.inner.set_online(online).await;
        Ok(())
    }

    /// Stop every task and release the listeners. Every later call fails
    /// with [`SyncError::Destroyed`].
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.tasks).abort_all();
        if let Some(in_flight) = lock(&self.inner.in_flight).take() {
            in_flight.abort.abort();
        }
        self.inner.pull.abort_background();
        self.inner.events.clear_listeners();
        tracing::info!("[Engine] Destroyed");
    }
}

impl EngineInner {
    fn ensure_alive(&self) -> Result<(), SyncError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SyncError::Destroyed);
        }
        Ok(())
    }

    async fn ensure_online(&self) -> Result<(), SyncError> {
        if !self.monitor.is_online().await {
            return Err(SyncError::Offline);
        }
        Ok(())
    }

    async fn set_status(&self, status: EngineStatus) {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut state.status, status)
        };
        if previous != status {
            tracing::info!("[Engine] Status {} -> {}", previous, status);
            self.events.emit(SyncEvent::StatusChange { status });
        }
    }

    async fn enqueue(
        self: &Arc<Self>,
        table: &str,
        kind: OperationKind,
        record_id: &str,
        payload: Value,
        priority: Option<Priority>,
    ) -> Result<EnqueueReceipt, SyncError> {
        let receipt = self
            .queue
            .enqueue(table, kind, record_id, payload, priority)
            .await?;

        if let Err(e) = apply_local(self.store.as_ref(), &receipt.operation).await {
            tracing::error!(
                "[Engine] Local apply of {} {}/{} failed, withdrawing it: {}",
                kind,
                table,
                record_id,
                e
            );
            if let Err(discard) = self.queue.discard(&receipt.operation).await {
                tracing::error!("[Engine] Could not withdraw {}: {}", receipt.operation.id, discard);
            }
            self.events.emit(SyncEvent::SyncError {
                error: e.to_string(),
            });
            return Err(e);
        }

        if receipt.evicted.is_some() {
            self.events.emit(SyncEvent::notification(
                "The sync queue is full; an older low-priority change was dropped",
                Severity::Warning,
            ));
        }
        if receipt.overflow {
            self.state.write().await.queue_overflow = true;
            let error = SyncError::queue_overflow(format!(
                "queue exceeds {} operations with only critical work queued",
                self.config.max_queue_size
            ));
            tracing::error!("[Engine] {}", error);
            self.events.emit(SyncEvent::SyncError {
                error: error.to_string(),
            });
        }

        self.monitor.record_activity().await;
        self.refresh_interval().await;

        if receipt.priority == Priority::Critical {
            self.schedule_critical_trigger();
        }
        Ok(receipt)
    }

    async fn trigger(self: &Arc<Self>) -> Result<CycleReport, SyncError> {
        self.ensure_alive()?;
        self.ensure_online().await?;

        let future = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(in_flight) => {
                    tracing::debug!("[Engine] Joining cycle {}", in_flight.generation);
                    in_flight.future.clone()
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let result = inner.run_cycle().await;
                        inner.finish_cycle(generation);
                        result
                    });
                    let abort = task.abort_handle();
                    let future = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) if e.is_cancelled() => Err(SyncError::Destroyed),
                            Err(e) => Err(SyncError::internal(format!("sync cycle panicked: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        generation,
                        future: future.clone(),
                        abort,
                    });
                    future
                }
            }
        };
        future.await
    }

    fn finish_cycle(&self, generation: u64) {
        let mut slot = lock(&self.in_flight);
        if slot.as_ref().map(|f| f.generation) == Some(generation) {
            *slot = None;
        }
    }

    async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport, SyncError> {
        let started = Instant::now();
        self.set_status(EngineStatus::Syncing).await;
        self.events.emit(SyncEvent::SyncStart);
        self.metrics.write().await.record_sync_start();
        tracing::info!("[Engine] Sync cycle started");

        match self.cycle_body(started).await {
            Ok(report) => {
                self.cycle_succeeded(&report).await;
                Ok(report)
            }
            Err(e) => {
                self.cycle_failed(&e).await;
                Err(e)
            }
        }
    }

    async fn cycle_body(&self, started: Instant) -> Result<CycleReport, SyncError> {
        let push = self.push.drain().await?;
        self.metrics
            .write()
            .await
            .record_operations(push.succeeded as u64, push.failed as u64);

        let tables = self.config.table_names();
        let table_pulls: Vec<BoxFuture<'_, Result<PullOutcome, SyncError>>> = tables
            .iter()
            .map(|table| self.pull.pull_table(table, PullOptions::default()).boxed())
            .collect();
        let results: Vec<_> = stream::iter(table_pulls)
            .buffered(self.config.prefetch_concurrency)
            .collect()
            .await;

        let mut pulls = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (table, result) in tables.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    self.metrics.write().await.record_pull(
                        outcome.stats.written() as u64,
                        outcome.stats.conflicts() as u64,
                    );
                    pulls.push(outcome);
                }
                Err(e) => {
                    tracing::error!("[Engine] Pull of {} failed: {}", table, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(CycleReport {
            push,
            pulls,
            duration: started.elapsed(),
        })
    }

    async fn cycle_succeeded(&self, report: &CycleReport) {
        let overflowed = self.state.read().await.queue_overflow;
        let below_capacity = overflowed
            && match self.queue.stats().await {
                Ok(stats) => (stats.pending as usize) < self.config.max_queue_size,
                Err(e) => {
                    tracing::warn!("[Engine] Could not read queue stats: {}", e);
                    false
                }
            };
        {
            let mut state = self.state.write().await;
            state.consecutive_failures = 0;
            state.last_sync = Some(Utc::now());
            state.last_error = None;
            if below_capacity {
                state.queue_overflow = false;
            }
        }
        self.metrics
            .write()
            .await
            .record_sync_success(report.duration);
        self.scheduler.record_sync().await;

        let status = if self.monitor.is_online().await {
            EngineStatus::Idle
        } else {
            EngineStatus::Offline
        };
        self.set_status(status).await;

        tracing::info!(
            "[Engine] Sync cycle finished in {:?}: {} pushed, {} failed, {} pulled",
            report.duration,
            report.push.succeeded,
            report.push.failed,
            report.pulled()
        );
        self.events.emit(SyncEvent::SyncComplete {
            pushed: report.push.succeeded,
            failed: report.push.failed,
            pulled: report.pulled(),
            duration_ms: report.duration.as_millis() as u64,
        });
    }

    async fn cycle_failed(self: &Arc<Self>, error: &SyncError) {
        let failures = {
            let mut state = self.state.write().await;
            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
            state.consecutive_failures
        };
        self.metrics.write().await.record_sync_failure();
        tracing::error!("[Engine] Sync cycle failed ({} in a row): {}", failures, error);
        self.events.emit(SyncEvent::SyncError {
            error: error.to_string(),
        });

        if !self.monitor.is_online().await {
            self.set_status(EngineStatus::Offline).await;
        } else if matches!(error, SyncError::Unauthorized { .. })
            || failures >= self.config.max_cycle_failures
        {
            tracing::error!("[Engine] Giving up until the next trigger");
            self.set_status(EngineStatus::Error).await;
        } else {
            self.set_status(EngineStatus::Reconnecting).await;
            self.schedule_retry(failures);
        }
    }

    /// Retry a failed cycle after `base * 2^(failures - 1)`
    fn schedule_retry(self: &Arc<Self>, failures: u32) {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = Duration::from_secs(self.config.cycle_backoff_base_secs) * 2u32.pow(exponent);
        tracing::info!("[Engine] Retrying the cycle in {:?}", delay);

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.state.read().await.status != EngineStatus::Reconnecting {
                return;
            }
            if let Err(e) = inner.trigger().await {
                tracing::debug!("[Engine] Retried cycle failed: {}", e);
            }
        });
        replace_task(&mut lock(&self.tasks).retry, task);
    }

    fn schedule_critical_trigger(self: &Arc<Self>) {
        if !self.config.auto_sync {
            return;
        }
        let mut tasks = lock(&self.tasks);
        if tasks.critical.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let delay = self.config.critical_debounce();
        let weak = Arc::downgrade(self);
        tasks.critical = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.monitor.is_online().await {
                return;
            }
            tracing::debug!("[Engine] Critical operations queued, syncing");
            if let Err(e) = inner.trigger().await {
                tracing::debug!("[Engine] Out-of-band cycle failed: {}", e);
            }
        }));
    }

    fn spawn_trigger(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.trigger().await {
                tracing::debug!("[Engine] Cycle failed: {}", e);
            }
        });
    }

    /// (Re)start the periodic timer with the current interval
    fn spawn_periodic(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(inner) => inner.scheduler.current_interval().await,
                    None => return,
                };
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.periodic_tick().await;
            }
        });
        replace_task(&mut lock(&self.tasks).periodic, task);
    }

    async fn periodic_tick(self: &Arc<Self>) {
        let status = self.state.read().await.status;
        let online = self.monitor.is_online().await;
        if !online || matches!(status, EngineStatus::Error | EngineStatus::Reconnecting) {
            tracing::debug!("[Engine] Skipping scheduled cycle ({})", status);
        } else if let Err(e) = self.trigger().await {
            tracing::debug!("[Engine] Scheduled cycle failed: {}", e);
        }
        self.refresh_interval().await;
    }

    /// Recompute the interval and reschedule the timer when it changed
    async fn refresh_interval(self: &Arc<Self>) {
        let active = self.monitor.is_user_active().await;
        let quality = self.monitor.connection().await.quality;
        if self.scheduler.update(active, quality).await.is_some()
            && self.started.load(Ordering::SeqCst)
            && self.config.auto_sync
            && !self.destroyed.load(Ordering::SeqCst)
            && self.monitor.is_online().await
        {
            self.spawn_periodic();
        }
    }

    fn spawn_probe_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.probe_interval();
        let timeout = self.config.probe_timeout();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.monitor.is_online().await {
                    continue;
                }
                // Failures are recorded by the monitor itself.
                let _ = inner.monitor.probe(&inner.backend, timeout).await;
                let quality = inner.monitor.connection().await.quality;
                inner.metrics.write().await.connection_quality = Some(quality);
                inner.refresh_interval().await;
            }
        });
        replace_task(&mut lock(&self.tasks).probe, task);
    }

    fn spawn_cleanup_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();
        let completed = chrono::Duration::seconds(self.config.completed_retention_secs);
        let failed = chrono::Duration::seconds(self.config.failed_retention_secs);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.queue.purge_finished(completed, failed).await {
                    tracing::warn!("[Engine] Queue cleanup failed: {}", e);
                }
                if let Err(e) = inner.purge_tombstones().await {
                    tracing::warn!("[Engine] Tombstone cleanup failed: {}", e);
                }
            }
        });
        replace_task(&mut lock(&self.tasks).cleanup, task);
    }

    async fn purge_tombstones(&self) -> Result<u64, SyncError> {
        let before = Utc::now() - chrono::Duration::seconds(self.config.tombstone_retention_secs);
        let removed = self.store.purge_tombstones(before).await?;
        if removed > 0 {
            tracing::info!("[Engine] Purged {} synced tombstones", removed);
        }
        Ok(removed)
    }

    async fn set_online(self: &Arc<Self>, online: bool) {
        let Some(change) = self.monitor.set_online(online).await else {
            return;
        };
        let quality = self.monitor.connection().await.quality;
        self.metrics.write().await.connection_quality = Some(quality);

        match change {
            ConnectivityChange::WentOffline => {
                {
                    let mut tasks = lock(&self.tasks);
                    for task in [tasks.periodic.take(), tasks.retry.take(), tasks.critical.take()]
                        .into_iter()
                        .flatten()
                    {
                        task.abort();
                    }
                }
                self.set_status(EngineStatus::Offline).await;
            }
            ConnectivityChange::WentOnline => {
                self.state.write().await.consecutive_failures = 0;
                self.set_status(EngineStatus::Idle).await;
                self.refresh_interval().await;
                if self.config.auto_sync && self.started.load(Ordering::SeqCst) {
                    self.spawn_periodic();
                    self.spawn_trigger();
                }
            }
        }
    }
}
