//! Worker launchers: how a feed's worker is brought to life.
//!
//! The supervisor only sees a `WorkerHandle`: the feed's drop-oldest result
//! queue plus a `WorkerProcess` it can signal, wait on and terminate.
//! - `ThreadLauncher` runs the worker on a dedicated OS thread
//! - `ProcessLauncher` (see `process`) runs it in a child process

use crate::error::SupervisorError;
use async_trait::async_trait;
use roadview_core::{build_pipeline, ResultQueue, SourceError, WorkerEvent, WorkerParts, WorkerSignals, WorkerSpec};
use roadview_env::Clock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

/// Interval at which `wait` re-checks a worker thread.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Control surface over a running worker.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// Whether the worker may still emit events.
    fn is_alive(&mut self) -> bool;

    /// Asks the worker to stop after its current frame.
    fn signal_stop(&self);

    fn set_backpressure(&self, on: bool);

    /// Waits up to `grace` for the worker to exit. Returns true if it did.
    async fn wait(&mut self, grace: Duration) -> bool;

    /// Forcibly ends the worker.
    async fn terminate(&mut self) -> Result<(), SupervisorError>;

    /// Short human-readable identity (thread name, pid).
    fn describe(&self) -> String;
}

/// A launched worker as seen by the supervisor.
pub struct WorkerHandle {
    pub queue: Arc<ResultQueue<WorkerEvent>>,
    pub process: Box<dyn WorkerProcess>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("process", &self.process.describe())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Starts workers.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle, SupervisorError>;
}

/// Builds the collaborators for a spec.
pub type PartsFactory = Arc<dyn Fn(&WorkerSpec) -> Result<WorkerParts, SourceError> + Send + Sync>;

/// Runs each worker on its own thread, with panics contained and reported
/// as fatal worker events.
#[derive(Clone)]
pub struct ThreadLauncher {
    factory: PartsFactory,
}

impl ThreadLauncher {
    /// Launcher using the default pipeline.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_factory(Arc::new(move |spec: &WorkerSpec| {
            build_pipeline(spec, clock.clone())
        }))
    }

    /// Launcher with custom collaborators.
    pub fn with_factory(factory: PartsFactory) -> Self {
        Self { factory }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, spec: WorkerSpec) -> Result<WorkerHandle, SupervisorError> {
        let parts = (self.factory)(&spec).map_err(|e| SupervisorError::WorkerLaunch(e.to_string()))?;
        let queue = spec.result_queue();
        let signals = WorkerSignals::new();
        let name = format!("worker-{}", spec.feed_id);

        let thread = {
            let queue = queue.clone();
            let signals = signals.clone();
            let feed_id = spec.feed_id.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        spec.into_loop(parts, queue.clone(), signals).run()
                    }));
                    if let Err(payload) = result {
                        let reason = format!("worker panicked: {}", panic_message(payload.as_ref()));
                        error!("{}: {}", feed_id, reason);
                        queue.push(WorkerEvent::Fatal { feed_id, reason });
                        queue.close();
                    }
                })
                .map_err(|e| SupervisorError::WorkerLaunch(e.to_string()))?
        };
        debug!("Launched {}", name);

        Ok(WorkerHandle {
            queue,
            process: Box::new(ThreadWorker {
                name,
                signals,
                thread: Some(thread),
            }),
        })
    }
}

struct ThreadWorker {
    name: String,
    signals: Arc<WorkerSignals>,
    thread: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerProcess for ThreadWorker {
    fn is_alive(&mut self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn signal_stop(&self) {
        self.signals.request_stop();
    }

    fn set_backpressure(&self, on: bool) {
        self.signals.set_backpressure(on);
    }

    async fn wait(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if !self.is_alive() {
                if let Some(thread) = self.thread.take() {
                    // Panics were already caught inside the thread
                    let _ = thread.join();
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(JOIN_POLL).await;
        }
    }

    async fn terminate(&mut self) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            return Ok(());
        }
        // Threads cannot be killed; detach it. The stop flag stays set.
        self.thread = None;
        Err(SupervisorError::ProcessTermination(format!(
            "{} did not stop in time and was detached",
            self.name
        )))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadview_core::{
        open_source, FeedSource, FrameThresholds, FrameTracker, OverlayRenderer, PipelineConfig, TrackMap,
        TrackingError, WorkerExit,
    };
    use roadview_env::SystemClock;

    fn synthetic_spec(frames: Option<u64>) -> WorkerSpec {
        WorkerSpec::new(
            "cam-1",
            FeedSource::Synthetic {
                seed: 1,
                frames,
                fps: 0.0,
            },
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_thread_worker_runs_to_end_of_stream() {
        let launcher = ThreadLauncher::new(Arc::new(SystemClock::new()));
        let mut handle = launcher.launch(synthetic_spec(Some(3))).unwrap();

        assert!(handle.process.wait(Duration::from_secs(10)).await);
        assert!(!handle.process.is_alive());
        let events = handle.queue.drain();
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Finished { reason: WorkerExit::EndOfStream, .. })
        ));
    }

    #[tokio::test]
    async fn test_thread_worker_stops_on_signal() {
        let launcher = ThreadLauncher::new(Arc::new(SystemClock::new()));
        let mut handle = launcher.launch(synthetic_spec(None)).unwrap();

        handle.process.signal_stop();
        assert!(handle.process.wait(Duration::from_secs(10)).await);
        assert!(handle.process.terminate().await.is_ok());
    }

    struct PanickingTracker;

    impl FrameTracker for PanickingTracker {
        fn detect_and_track(
            &mut self,
            _frame: &image::RgbImage,
            _frame_index: u64,
            _thresholds: &FrameThresholds,
        ) -> Result<TrackMap, TrackingError> {
            panic!("tracker exploded")
        }

        fn num_lanes(&self) -> u32 {
            3
        }

        fn release(&mut self) {}
    }

    #[tokio::test]
    async fn test_panicking_worker_reports_fatal() {
        let launcher = ThreadLauncher::with_factory(Arc::new(|spec: &WorkerSpec| -> Result<WorkerParts, SourceError> {
            Ok(WorkerParts {
                source: open_source(&spec.source)?,
                tracker: Box::new(PanickingTracker),
                visualizer: Box::new(OverlayRenderer::new(3)),
            })
        }));
        let mut handle = launcher.launch(synthetic_spec(None)).unwrap();

        assert!(handle.process.wait(Duration::from_secs(10)).await);
        match handle.queue.drain().last() {
            Some(WorkerEvent::Fatal { reason, .. }) => assert!(reason.contains("tracker exploded")),
            other => panic!("expected fatal event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_factory_error_is_launch_error() {
        let launcher = ThreadLauncher::with_factory(Arc::new(|_spec: &WorkerSpec| -> Result<WorkerParts, SourceError> {
            Err(SourceError::Unsupported("nope".to_string()))
        }));
        assert!(matches!(
            launcher.launch(synthetic_spec(None)),
            Err(SupervisorError::WorkerLaunch(_))
        ));
    }
}
