//! The FEED Supervisor - registry, lifecycle and result reader for all feeds.
//!
//! ```text
//!            add_and_start / start / stop / restart / stop_all / remove
//!                                  │  (ops lock: one at a time)
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Registry (std Mutex, short critical sections)                    │
//! │   feed id ─▶ FeedEntry { status, handle, latest result, ... }    │
//! └──────────────────────────────────────────────────────────────────┘
//!          ▲                                   │
//!          │ poll_once(): drain queues,        │ WorkerLauncher
//!          │ last frame wins                   ▼
//!     reader task ◀──── ResultQueue ◀──── worker (thread / process)
//! ```
//!
//! Status changes are published on the `BroadcastSink` as they happen; KPIs
//! are published by the reader task every `kpi_interval`.
//!
//! Every state-changing operation holds the ops lock for its whole duration,
//! including the sample-feed policy that runs at its end. Follow-up work the
//! reader discovers (reaping a dead worker, finishing a drained stream) is
//! spawned onto its own task so the reader never waits on a worker.

use crate::broadcast::{AlertLevel, BroadcastSink, FeedKpi, KpiSnapshot, SupervisorEvent};
use crate::error::SupervisorError;
use crate::launcher::{WorkerHandle, WorkerLauncher};
use crate::state::FeedStatus;
use roadview_core::{FeedSource, PipelineConfig, ResultMessage, WorkerEvent, WorkerExit, WorkerSpec};
use roadview_env::AdmissionProbe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry key of the sample feed.
pub const SAMPLE_FEED_ID: &str = "sample";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the FeedSupervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Admission rejects new feeds at or above this memory usage (default: 85%)
    pub memory_limit_percent: f32,

    /// How long a stopping worker may take before it is terminated (default: 3 s)
    pub stop_grace_period: Duration,

    /// Pause between reader polls (default: 20 ms)
    pub poll_interval: Duration,

    /// Period of KPI broadcasts (default: 1 s)
    pub kpi_interval: Duration,

    /// Source of the sample feed; `None` disables it
    pub sample_source: Option<FeedSource>,

    /// Worker and tracking tuning handed to every worker
    pub pipeline: PipelineConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            memory_limit_percent: 85.0,
            stop_grace_period: Duration::from_secs(3),
            poll_interval: Duration::from_millis(20),
            kpi_interval: Duration::from_secs(1),
            sample_source: Some(FeedSource::sample()),
            pipeline: PipelineConfig::default(),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    User,
    Sample,
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct FeedInfo {
    pub feed_id: String,
    pub name: String,
    pub kind: FeedKind,
    pub source: FeedSource,
    pub status: FeedStatus,
    /// Last error or status note
    pub message: Option<String>,
    /// Whether a worker is still attached
    pub has_worker: bool,
    pub frames_received: u64,
    pub last_frame_index: Option<u64>,
}

struct FeedEntry {
    id: String,
    name: String,
    kind: FeedKind,
    source: FeedSource,
    status: FeedStatus,
    message: Option<String>,
    handle: Option<WorkerHandle>,
    /// Bumped on every launch so late follow-ups for an old worker are ignored
    generation: u64,
    /// Set once the worker's final event (or its death) has been handled
    terminal_seen: bool,
    last_dropped: u64,
    frames_received: u64,
    latest: Option<Arc<ResultMessage>>,
}

impl FeedEntry {
    fn new(id: String, name: String, kind: FeedKind, source: FeedSource) -> Self {
        Self {
            id,
            name,
            kind,
            source,
            status: FeedStatus::Stopped,
            message: None,
            handle: None,
            generation: 0,
            terminal_seen: false,
            last_dropped: 0,
            frames_received: 0,
            latest: None,
        }
    }

    fn info(&self) -> FeedInfo {
        FeedInfo {
            feed_id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            source: self.source.clone(),
            status: self.status,
            message: self.message.clone(),
            has_worker: self.handle.is_some(),
            frames_received: self.frames_received,
            last_frame_index: self.latest.as_ref().map(|m| m.frame_index),
        }
    }

    /// Applies a legal transition, returning the status event to publish.
    fn transition(&mut self, to: FeedStatus, message: Option<String>) -> Result<SupervisorEvent, SupervisorError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(SupervisorError::InvalidTransition {
                feed_id: self.id.clone(),
                from,
                to,
            });
        }
        self.status = to;
        self.message = message.clone();
        Ok(SupervisorEvent::FeedStatus {
            feed_id: self.id.clone(),
            from,
            to,
            message,
        })
    }
}

#[derive(Default)]
struct Registry {
    feeds: BTreeMap<String, FeedEntry>,
}

impl Registry {
    fn get_mut(&mut self, id: &str) -> Result<&mut FeedEntry, SupervisorError> {
        self.feeds
            .get_mut(id)
            .ok_or_else(|| SupervisorError::FeedNotFound(id.to_string()))
    }

    fn user_feed_active(&self) -> bool {
        self.feeds
            .values()
            .any(|e| e.kind == FeedKind::User && e.status.is_active())
    }
}

/// Work the reader hands off to a separate task.
enum FollowUp {
    /// Worker died or failed: collect it; the feed stays in Error
    Reap { id: String, generation: u64 },
    /// Worker drained its stream: run the stop sequence
    Finish { id: String, generation: u64 },
}

// ============================================================================
// SUPERVISOR
// ============================================================================

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn AdmissionProbe>,
    sink: Arc<dyn BroadcastSink>,
    registry: Mutex<Registry>,
    ops: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

/// Manages the lifecycle of every feed. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FeedSupervisor {
    inner: Arc<Inner>,
}

impl FeedSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn AdmissionProbe>,
        sink: Arc<dyn BroadcastSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                probe,
                sink,
                registry: Mutex::new(Registry::default()),
                ops: tokio::sync::Mutex::new(()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: SupervisorEvent) {
        if let SupervisorEvent::FeedStatus {
            feed_id,
            to: FeedStatus::Error,
            message,
            ..
        } = &event
        {
            let alert = SupervisorEvent::Alert {
                level: AlertLevel::Critical,
                feed_id: Some(feed_id.clone()),
                message: message.clone().unwrap_or_else(|| "feed failed".to_string()),
            };
            self.inner.sink.publish(event);
            self.inner.sink.publish(alert);
        } else {
            self.inner.sink.publish(event);
        }
    }

    fn ensure_accepting(&self) -> Result<(), SupervisorError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            Err(SupervisorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Rejects a new worker when memory is at or above the limit. The sample
    /// feed is exempt while no user feed is starting or running.
    fn admit(&self, kind: FeedKind) -> Result<(), SupervisorError> {
        if kind == FeedKind::Sample && !self.registry().user_feed_active() {
            return Ok(());
        }
        let load = self.inner.probe.system_load()?;
        let limit = self.inner.config.memory_limit_percent;
        debug!(
            "Admission check: cpu {:.1}%, memory {:.1}% (limit {:.1}%)",
            load.cpu_percent, load.memory_percent, limit
        );
        if load.memory_percent >= limit {
            return Err(SupervisorError::ResourceLimit {
                memory_percent: load.memory_percent,
                limit_percent: limit,
            });
        }
        Ok(())
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Validates `source`, runs admission control, registers a new feed and
    /// launches its worker. Returns the new feed ID.
    ///
    /// If the worker cannot be launched the feed is kept in `Error` and the
    /// launch error is returned.
    pub async fn add_and_start(&self, source: FeedSource, name_hint: &str) -> Result<String, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        self.ensure_accepting()?;
        source.validate()?;
        self.admit(FeedKind::User)?;

        let id = new_feed_id(name_hint);
        info!("Adding feed {} ({})", id, source);
        self.registry().feeds.insert(
            id.clone(),
            FeedEntry::new(id.clone(), name_hint.to_string(), FeedKind::User, source),
        );

        let launched = self.launch_entry(&id);
        self.apply_sample_policy_locked().await;
        launched.map(|_| id)
    }

    /// Starts a stopped feed.
    pub async fn start_feed(&self, id: &str) -> Result<(), SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        self.ensure_accepting()?;
        let kind = {
            let mut registry = self.registry();
            let entry = registry.get_mut(id)?;
            check_transition(entry, FeedStatus::Starting)?;
            entry.kind
        };
        self.admit(kind)?;
        let launched = self.launch_entry(id);
        self.apply_sample_policy_locked().await;
        launched
    }

    /// Stops a running feed, or clears a feed in `Error` back to `Stopped`.
    ///
    /// Holds the ops lock through the stop sequence, so other operations on
    /// any feed wait up to `stop_grace_period` behind a slow worker. The
    /// sample-feed decision that follows always sees settled state.
    ///
    /// A worker that has to be force-terminated and cannot be ends `Stopped`
    /// anyway; the failure is recorded as the feed's message and returned as
    /// `ProcessTermination`.
    pub async fn stop_feed(&self, id: &str) -> Result<(), SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let status = self.status_of(id)?;
        let result = match status {
            FeedStatus::Running | FeedStatus::Error => self.stop_sequence(id, None).await,
            other => Err(SupervisorError::InvalidTransition {
                feed_id: id.to_string(),
                from: other,
                to: FeedStatus::Stopped,
            }),
        };
        self.apply_sample_policy_locked().await;
        result
    }

    /// Stop then start. Allowed from `Running` or `Error`.
    pub async fn restart_feed(&self, id: &str) -> Result<(), SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        self.ensure_accepting()?;
        let status = self.status_of(id)?;
        if !matches!(status, FeedStatus::Running | FeedStatus::Error) {
            return Err(SupervisorError::InvalidTransition {
                feed_id: id.to_string(),
                from: status,
                to: FeedStatus::Starting,
            });
        }
        info!("Restarting feed {}", id);
        if let Err(e) = self.stop_sequence(id, Some("restarting".to_string())).await {
            // The old worker may still be around; never launch a second one
            self.apply_sample_policy_locked().await;
            return Err(e);
        }
        let launched = self.launch_entry(id);
        self.apply_sample_policy_locked().await;
        launched
    }

    /// Stops every user feed: running feeds are stopped, starting feeds are
    /// aborted and failed feeds are cleared. The sample policy then runs, so
    /// the sample feed comes up afterwards.
    pub async fn stop_all(&self) -> Result<(), SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let mut first_error = None;
        for (id, status) in self.statuses(Some(FeedKind::User)) {
            if let Err(e) = self.stop_any(&id, status).await {
                warn!("Stopping {} failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        self.apply_sample_policy_locked().await;
        first_error.map_or(Ok(()), Err)
    }

    /// Removes a stopped or failed feed from the registry.
    pub async fn remove_feed(&self, id: &str) -> Result<FeedInfo, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        let removed = {
            let mut registry = self.registry();
            let entry = registry.get_mut(id)?;
            if entry.status.is_active() {
                return Err(SupervisorError::FeedActive(id.to_string()));
            }
            registry.feeds.remove(id)
        };
        let mut entry = removed.ok_or_else(|| SupervisorError::FeedNotFound(id.to_string()))?;
        let collected = match entry.handle.take() {
            Some(handle) => self.collect_worker(id, handle).await,
            None => Ok(()),
        };
        info!("Removed feed {}", id);
        self.apply_sample_policy_locked().await;
        collected.map(|_| entry.info())
    }

    /// Stops everything, including the sample feed, and refuses further
    /// starts. The reader task exits on its next iteration.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _ops = self.inner.ops.lock().await;
        info!("Supervisor shutting down");
        for (id, status) in self.statuses(None) {
            let result = match status {
                FeedStatus::Stopped => Ok(()),
                FeedStatus::Error => {
                    let handle = self.registry().get_mut(&id).ok().and_then(|e| e.handle.take());
                    match handle {
                        Some(handle) => self.collect_worker(&id, handle).await,
                        None => Ok(()),
                    }
                }
                other => self.stop_any(&id, other).await,
            };
            if let Err(e) = result {
                warn!("Shutdown of {} incomplete: {}", id, e);
            }
        }
    }

    /// Runs the sample-feed policy once.
    pub async fn apply_sample_policy(&self) {
        let _ops = self.inner.ops.lock().await;
        self.apply_sample_policy_locked().await;
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn feeds(&self) -> Vec<FeedInfo> {
        self.registry().feeds.values().map(FeedEntry::info).collect()
    }

    pub fn feed(&self, id: &str) -> Result<FeedInfo, SupervisorError> {
        self.registry()
            .feeds
            .get(id)
            .map(FeedEntry::info)
            .ok_or_else(|| SupervisorError::FeedNotFound(id.to_string()))
    }

    /// Most recent processed frame of a feed, if any arrived yet.
    pub fn latest_result(&self, id: &str) -> Result<Option<Arc<ResultMessage>>, SupervisorError> {
        self.registry()
            .feeds
            .get(id)
            .map(|e| e.latest.clone())
            .ok_or_else(|| SupervisorError::FeedNotFound(id.to_string()))
    }

    /// Aggregate indicators over running feeds.
    pub fn kpis(&self) -> KpiSnapshot {
        let registry = self.registry();
        let mut snapshot = KpiSnapshot {
            active_feeds: registry.feeds.values().filter(|e| e.status.is_active()).count(),
            ..KpiSnapshot::default()
        };
        for entry in registry.feeds.values() {
            if entry.status != FeedStatus::Running {
                continue;
            }
            if let Some(latest) = &entry.latest {
                snapshot.total_vehicles += latest.metrics.vehicle_count;
                snapshot.per_feed.push(FeedKpi {
                    feed_id: entry.id.clone(),
                    vehicle_count: latest.metrics.vehicle_count,
                    avg_speed_kmh: latest.metrics.avg_speed_kmh,
                    congestion: latest.metrics.congestion,
                    fps: latest.timing.fps,
                });
            }
        }
        if !snapshot.per_feed.is_empty() {
            snapshot.avg_speed_kmh =
                snapshot.per_feed.iter().map(|f| f.avg_speed_kmh).sum::<f64>() / snapshot.per_feed.len() as f64;
        }
        snapshot
    }

    fn status_of(&self, id: &str) -> Result<FeedStatus, SupervisorError> {
        self.registry()
            .feeds
            .get(id)
            .map(|e| e.status)
            .ok_or_else(|| SupervisorError::FeedNotFound(id.to_string()))
    }

    fn statuses(&self, kind: Option<FeedKind>) -> Vec<(String, FeedStatus)> {
        self.registry()
            .feeds
            .values()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .map(|e| (e.id.clone(), e.status))
            .collect()
    }

    // ========================================================================
    // LIFECYCLE STEPS (ops lock held by caller)
    // ========================================================================

    /// `Stopped -> Starting`, then launch. A launch failure moves the feed
    /// to `Error` and keeps it registered.
    fn launch_entry(&self, id: &str) -> Result<(), SupervisorError> {
        let (spec, event) = {
            let mut registry = self.registry();
            let entry = registry.get_mut(id)?;
            let event = entry.transition(FeedStatus::Starting, None)?;
            entry.generation += 1;
            entry.terminal_seen = false;
            entry.last_dropped = 0;
            entry.latest = None;
            let spec = WorkerSpec::new(id, entry.source.clone(), self.inner.config.pipeline.clone());
            (spec, event)
        };
        self.publish(event);

        match self.inner.launcher.launch(spec) {
            Ok(handle) => {
                debug!("Feed {} launched on {}", id, handle.process.describe());
                self.registry().get_mut(id)?.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Launch of {} failed: {}", id, message);
                let event = self.registry().get_mut(id)?.transition(FeedStatus::Error, Some(message.clone()))?;
                self.publish(event);
                Err(SupervisorError::WorkerLaunch(format!("{id}: {message}")))
            }
        }
    }

    /// Stop sequence: signal, wait up to the grace period, terminate if
    /// needed, release the channel, then `-> Stopped`.
    ///
    /// A termination failure still ends `Stopped`: the error text becomes
    /// the feed's message and the error is returned.
    async fn stop_sequence(&self, id: &str, message: Option<String>) -> Result<(), SupervisorError> {
        let handle = {
            let mut registry = self.registry();
            let entry = registry.get_mut(id)?;
            check_transition(entry, FeedStatus::Stopped)?;
            let handle = entry.handle.take();
            if let Some(handle) = &handle {
                handle.process.signal_stop();
            }
            handle
        };

        let collected = match handle {
            Some(handle) => self.collect_worker(id, handle).await,
            None => Ok(()),
        };
        let message = match &collected {
            Ok(()) => message,
            Err(e) => Some(e.to_string()),
        };

        let event = {
            let mut registry = self.registry();
            let entry = registry.get_mut(id)?;
            entry.terminal_seen = true;
            entry.transition(FeedStatus::Stopped, message)?
        };
        self.publish(event);
        collected
    }

    /// Stops a feed whatever its active state. `Starting` feeds are aborted
    /// through `Error` since `Starting -> Stopped` is not a legal step.
    async fn stop_any(&self, id: &str, status: FeedStatus) -> Result<(), SupervisorError> {
        match status {
            FeedStatus::Stopped => Ok(()),
            FeedStatus::Running | FeedStatus::Error => self.stop_sequence(id, None).await,
            FeedStatus::Starting => {
                let event = self
                    .registry()
                    .get_mut(id)?
                    .transition(FeedStatus::Error, Some("start aborted".to_string()))?;
                // Requested abort, not a failure: status only, no alert
                self.inner.sink.publish(event);
                self.stop_sequence(id, None).await
            }
        }
    }

    /// Waits for a signalled worker, terminates it if it overstays, and
    /// drops its channel. The channel is released even when termination
    /// fails.
    async fn collect_worker(&self, id: &str, mut handle: WorkerHandle) -> Result<(), SupervisorError> {
        handle.process.signal_stop();
        let mut result = Ok(());
        if !handle.process.wait(self.inner.config.stop_grace_period).await {
            warn!(
                "Worker {} ({}) ignored stop for {:?}, terminating",
                id,
                handle.process.describe(),
                self.inner.config.stop_grace_period
            );
            if let Err(e) = handle.process.terminate().await {
                warn!("{}", e);
                self.inner.sink.publish(SupervisorEvent::Alert {
                    level: AlertLevel::Warning,
                    feed_id: Some(id.to_string()),
                    message: e.to_string(),
                });
                result = Err(e);
            }
        }
        let leftover = handle.queue.drain().len();
        if leftover > 0 {
            debug!("Discarded {} queued events from {}", leftover, id);
        }
        result
    }

    /// Sample feed runs iff no user feed is starting or running.
    async fn apply_sample_policy_locked(&self) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(sample_source) = self.inner.config.sample_source.clone() else {
            return;
        };

        let (user_active, sample_status) = {
            let registry = self.registry();
            (
                registry.user_feed_active(),
                registry.feeds.get(SAMPLE_FEED_ID).map(|e| e.status),
            )
        };

        let result = if user_active {
            match sample_status {
                Some(status @ (FeedStatus::Running | FeedStatus::Starting)) => {
                    info!("User feed active, stopping sample feed");
                    self.stop_any(SAMPLE_FEED_ID, status).await
                }
                _ => Ok(()),
            }
        } else {
            match sample_status {
                None => {
                    self.registry().feeds.insert(
                        SAMPLE_FEED_ID.to_string(),
                        FeedEntry::new(
                            SAMPLE_FEED_ID.to_string(),
                            SAMPLE_FEED_ID.to_string(),
                            FeedKind::Sample,
                            sample_source,
                        ),
                    );
                    self.start_sample()
                }
                Some(FeedStatus::Stopped) => self.start_sample(),
                // Error is left for an operator to clear
                Some(_) => Ok(()),
            }
        };
        if let Err(e) = result {
            warn!("Sample feed policy: {}", e);
        }
    }

    fn start_sample(&self) -> Result<(), SupervisorError> {
        info!("No user feed active, starting sample feed");
        self.admit(FeedKind::Sample)?;
        self.launch_entry(SAMPLE_FEED_ID)
    }

    // ========================================================================
    // RESULT READER
    // ========================================================================

    /// One reader pass over every starting or running feed.
    ///
    /// Drains each result queue completely and keeps only the newest frame;
    /// detects `Starting -> Running`, worker failure and unexpected worker
    /// death; toggles backpressure on feeds whose queue overflowed since
    /// the last pass.
    pub async fn poll_once(&self) {
        let mut events = Vec::new();
        let mut follow_ups = Vec::new();

        {
            let mut registry = self.registry();
            for entry in registry.feeds.values_mut() {
                if entry.status.is_active() && !entry.terminal_seen {
                    poll_entry(entry, &mut events, &mut follow_ups);
                }
            }
        }

        for event in events {
            self.publish(event);
        }
        for follow_up in follow_ups {
            let this = self.clone();
            tokio::spawn(async move { this.handle_follow_up(follow_up).await });
        }
    }

    async fn handle_follow_up(&self, follow_up: FollowUp) {
        let _ops = self.inner.ops.lock().await;
        match follow_up {
            FollowUp::Reap { id, generation } => {
                let handle = {
                    let mut registry = self.registry();
                    match registry.feeds.get_mut(&id) {
                        Some(entry) if entry.generation == generation => entry.handle.take(),
                        _ => None,
                    }
                };
                if let Some(handle) = handle {
                    match self.collect_worker(&id, handle).await {
                        Ok(()) => debug!("Reaped worker of {}", id),
                        Err(e) => warn!("Reaping {} failed: {}", id, e),
                    }
                }
            }
            FollowUp::Finish { id, generation } => {
                let current = {
                    let registry = self.registry();
                    registry
                        .feeds
                        .get(&id)
                        .map_or(false, |e| e.generation == generation && e.status == FeedStatus::Running)
                };
                if current {
                    info!("Feed {} reached end of stream", id);
                    if let Err(e) = self.stop_sequence(&id, Some("end of stream".to_string())).await {
                        warn!("Finishing {} failed: {}", id, e);
                    }
                }
            }
        }
        self.apply_sample_policy_locked().await;
    }

    /// Polls every `poll_interval` and publishes KPIs every `kpi_interval`
    /// until `shutdown` is called.
    pub fn spawn_reader(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut last_kpi = Instant::now();
            while !this.inner.shutting_down.load(Ordering::SeqCst) {
                this.poll_once().await;
                if last_kpi.elapsed() >= this.inner.config.kpi_interval {
                    this.inner.sink.publish(SupervisorEvent::Kpis(this.kpis()));
                    last_kpi = Instant::now();
                }
                tokio::time::sleep(this.inner.config.poll_interval).await;
            }
            debug!("Result reader stopped");
        })
    }
}

fn check_transition(entry: &FeedEntry, to: FeedStatus) -> Result<(), SupervisorError> {
    if entry.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(SupervisorError::InvalidTransition {
            feed_id: entry.id.clone(),
            from: entry.status,
            to,
        })
    }
}

/// Reader logic for one entry. Runs under the registry lock, so it only
/// touches in-memory state and collects what must happen afterwards.
fn poll_entry(entry: &mut FeedEntry, events: &mut Vec<SupervisorEvent>, follow_ups: &mut Vec<FollowUp>) {
    let Some(handle) = entry.handle.as_mut() else {
        return;
    };

    // Liveness first: once a worker is seen dead, everything it sent is
    // already queued and the drain below picks it up.
    let was_alive = handle.process.is_alive();
    let drained = handle.queue.drain();
    let dropped = handle.queue.dropped();
    handle.process.set_backpressure(dropped > entry.last_dropped);
    entry.last_dropped = dropped;

    let vanished = !was_alive && drained.is_empty();
    let mut ready = false;
    let mut latest = None;
    let mut terminal = None;
    for event in drained {
        match event {
            WorkerEvent::Ready { .. } => ready = true,
            WorkerEvent::Frame(message) => {
                entry.frames_received += 1;
                latest = Some(message);
            }
            WorkerEvent::Finished { reason, .. } => terminal = Some(reason),
            WorkerEvent::Fatal { reason, .. } => {
                terminal = Some(WorkerExit::Failed(SupervisorError::WorkerRuntime(reason).to_string()))
            }
        }
    }

    let produced = latest.is_some();
    if let Some(message) = latest {
        entry.latest = Some(Arc::new(*message));
    }

    if entry.status == FeedStatus::Starting && (ready || produced) {
        if let Ok(event) = entry.transition(FeedStatus::Running, None) {
            events.push(event);
        }
    }

    let generation = entry.generation;
    let id = entry.id.clone();
    match terminal {
        Some(WorkerExit::Failed(reason)) => {
            entry.terminal_seen = true;
            if let Ok(event) = entry.transition(FeedStatus::Error, Some(reason)) {
                events.push(event);
            }
            follow_ups.push(FollowUp::Reap { id, generation });
        }
        Some(WorkerExit::EndOfStream) | Some(WorkerExit::Stopped) => {
            entry.terminal_seen = true;
            follow_ups.push(FollowUp::Finish { id, generation });
        }
        None => {
            if vanished {
                entry.terminal_seen = true;
                if let Ok(event) = entry.transition(FeedStatus::Error, Some("unexpected termination".to_string())) {
                    events.push(event);
                }
                follow_ups.push(FollowUp::Reap { id, generation });
            }
        }
    }
}

/// `<sanitized hint>-<8 hex chars>`.
fn new_feed_id(name_hint: &str) -> String {
    let mut base: String = name_hint
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    base = base.trim_matches('-').to_string();
    if base.is_empty() {
        base = "feed".to_string();
    }
    base.truncate(32);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}
