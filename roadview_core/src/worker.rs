//! Worker Loop - drives one feed from frame source to result queue.
//!
//! ```text
//! ┌──────────────┐   ┌────────┐   ┌──────────┐   ┌─────────┐   ┌────────────┐
//! │ FrameSource  │──▶│  skip  │──▶│ resize + │──▶│ metrics │──▶│ annotate + │──▶ ResultQueue
//! │   read()     │   │ policy │   │  track   │   │         │   │   encode   │    (drop-oldest)
//! └──────────────┘   └────────┘   └──────────┘   └─────────┘   └────────────┘
//!        ▲                ▲
//!        └── stop flag ───┴── backpressure flag (WorkerSignals, set by supervisor)
//! ```
//!
//! The loop never blocks on its consumer. The source and tracker are
//! released exactly once, whichever way the loop exits.

use crate::message::{ResultMessage, WorkerEvent, WorkerExit};
use crate::metrics::{compute_metrics, CongestionConfig, TimingStats};
use crate::queue::ResultQueue;
use crate::source::{FrameRead, FrameSource, SourceError};
use crate::tracking::{FrameThresholds, TrackingEngine, TrackingError};
use crate::types::TrackMap;
use crate::visualizer::{encode_jpeg, Visualizer};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pause after a transient source read failure.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Reasons a worker gives up.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Source lost: {0}")]
    SourceLost(SourceError),

    #[error("{count} consecutive read failures, last: {last}")]
    ReadFailures { count: u32, last: SourceError },

    #[error("{count} consecutive tracking errors, last: {last}")]
    TrackingFailures { count: u32, last: TrackingError },
}

/// Configuration for a worker loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Frames are resized to this (width, height) before tracking (default: 640x360)
    pub frame_resolution: (u32, u32),

    /// Capacity of the drop-oldest result queue (default: 4)
    pub result_queue_capacity: usize,

    /// Consecutive tracking (or read) failures that end the worker (default: 10)
    pub max_consecutive_errors: u32,

    /// Process every Nth frame when not under backpressure (default: 1)
    pub frame_skip: u64,

    /// Skip interval multiplier under backpressure (default: 3)
    pub backpressure_skip_factor: u64,

    /// Upper bound on the skip interval (default: 9)
    pub max_frame_skip: u64,

    /// JPEG quality of the annotated frame (default: 75)
    pub jpeg_quality: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_resolution: (640, 360),
            result_queue_capacity: 4,
            max_consecutive_errors: 10,
            frame_skip: 1,
            backpressure_skip_factor: 3,
            max_frame_skip: 9,
            jpeg_quality: 75,
        }
    }
}

impl WorkerConfig {
    /// Current frame-skip interval.
    pub fn skip_interval(&self, backpressure: bool) -> u64 {
        let base = self.frame_skip.max(1);
        if backpressure {
            (base * self.backpressure_skip_factor.max(1)).min(self.max_frame_skip.max(base))
        } else {
            base
        }
    }
}

/// Flags the supervisor sets and the worker polls once per iteration.
#[derive(Debug, Default)]
pub struct WorkerSignals {
    stop: AtomicBool,
    backpressure: AtomicBool,
}

impl WorkerSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn set_backpressure(&self, on: bool) {
        self.backpressure.store(on, Ordering::Relaxed);
    }

    pub fn backpressure(&self) -> bool {
        self.backpressure.load(Ordering::Relaxed)
    }
}

/// What the worker loop needs from a tracker.
pub trait FrameTracker: Send {
    fn detect_and_track(
        &mut self,
        frame: &RgbImage,
        frame_index: u64,
        thresholds: &FrameThresholds,
    ) -> Result<TrackMap, TrackingError>;

    /// Lane count used for per-lane metrics.
    fn num_lanes(&self) -> u32;

    /// Frees tracker state. Called once when the worker exits.
    fn release(&mut self);
}

impl FrameTracker for TrackingEngine {
    fn detect_and_track(
        &mut self,
        frame: &RgbImage,
        frame_index: u64,
        thresholds: &FrameThresholds,
    ) -> Result<TrackMap, TrackingError> {
        TrackingEngine::detect_and_track(self, frame, frame_index, thresholds)
    }

    fn num_lanes(&self) -> u32 {
        self.config().num_lanes
    }

    fn release(&mut self) {
        self.clear();
    }
}

/// The per-feed collaborators a worker owns.
pub struct WorkerParts {
    pub source: Box<dyn FrameSource>,
    pub tracker: Box<dyn FrameTracker>,
    pub visualizer: Box<dyn Visualizer>,
}

/// Runs one feed until stop, end of stream, or fatal failure.
pub struct WorkerLoop {
    feed_id: String,
    config: WorkerConfig,
    thresholds: FrameThresholds,
    congestion: CongestionConfig,
    parts: WorkerParts,
    queue: Arc<ResultQueue<WorkerEvent>>,
    signals: Arc<WorkerSignals>,

    consecutive_errors: u32,
    skipped_frames: u64,
    fps: f64,
    last_processed: Option<Instant>,
    released: bool,
}

impl WorkerLoop {
    pub fn new(
        feed_id: impl Into<String>,
        config: WorkerConfig,
        thresholds: FrameThresholds,
        parts: WorkerParts,
        queue: Arc<ResultQueue<WorkerEvent>>,
        signals: Arc<WorkerSignals>,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            config,
            thresholds,
            congestion: CongestionConfig::default(),
            parts,
            queue,
            signals,
            consecutive_errors: 0,
            skipped_frames: 0,
            fps: 0.0,
            last_processed: None,
            released: false,
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    /// Runs the loop to completion and reports the outcome on the queue.
    ///
    /// Emits `Ready` first, then one `Frame` per processed frame, then
    /// exactly one `Finished` or `Fatal`.
    pub fn run(&mut self) -> WorkerExit {
        info!("Worker {} started", self.feed_id);
        self.queue.push(WorkerEvent::Ready {
            feed_id: self.feed_id.clone(),
        });

        let exit = self
            .process_frames()
            .unwrap_or_else(|e| WorkerExit::Failed(e.to_string()));
        self.release();

        let event = match &exit {
            WorkerExit::Failed(reason) => {
                warn!("Worker {} failed: {}", self.feed_id, reason);
                WorkerEvent::Fatal {
                    feed_id: self.feed_id.clone(),
                    reason: reason.clone(),
                }
            }
            reason => {
                info!("Worker {} finished: {:?}", self.feed_id, reason);
                WorkerEvent::Finished {
                    feed_id: self.feed_id.clone(),
                    reason: reason.clone(),
                }
            }
        };
        self.queue.push(event);
        self.queue.close();
        exit
    }

    fn process_frames(&mut self) -> Result<WorkerExit, WorkerError> {
        let mut read_errors = 0u32;
        loop {
            if self.signals.stop_requested() {
                return Ok(WorkerExit::Stopped);
            }

            let (index, frame) = match self.parts.source.read() {
                Ok(FrameRead::Frame { index, image }) => {
                    read_errors = 0;
                    (index, image)
                }
                Ok(FrameRead::EndOfStream) => return Ok(WorkerExit::EndOfStream),
                Err(e) => {
                    if !self.parts.source.is_alive() {
                        return Err(WorkerError::SourceLost(e));
                    }
                    read_errors += 1;
                    if read_errors >= self.config.max_consecutive_errors {
                        return Err(WorkerError::ReadFailures {
                            count: read_errors,
                            last: e,
                        });
                    }
                    debug!("Transient read failure on {}: {}", self.feed_id, e);
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }
            };

            let interval = self.config.skip_interval(self.signals.backpressure());
            if index % interval != 0 {
                self.skipped_frames += 1;
                continue;
            }

            self.process_frame(index, frame)?;
        }
    }

    /// Fails once the consecutive-error threshold is hit.
    fn process_frame(&mut self, index: u64, frame: RgbImage) -> Result<(), WorkerError> {
        let started = Instant::now();
        let frame = self.resize(frame);

        let tracks = match self
            .parts
            .tracker
            .detect_and_track(&frame, index, &self.thresholds)
        {
            Ok(tracks) => {
                self.consecutive_errors = 0;
                tracks
            }
            Err(e) => {
                self.consecutive_errors += 1;
                warn!(
                    "Tracking failed on {} frame {} ({}/{}): {}",
                    self.feed_id, index, self.consecutive_errors, self.config.max_consecutive_errors, e
                );
                if self.consecutive_errors >= self.config.max_consecutive_errors {
                    return Err(WorkerError::TrackingFailures {
                        count: self.consecutive_errors,
                        last: e,
                    });
                }
                return Ok(());
            }
        };
        let track_ms = ms_since(started);

        let metrics = compute_metrics(&tracks, self.parts.tracker.num_lanes(), &self.congestion);

        let annotate_started = Instant::now();
        let annotated = match self.parts.visualizer.annotate(&frame, &tracks, &metrics) {
            Ok(img) => Some(img),
            Err(e) => {
                debug!("Annotation failed on {}, sending raw frame: {}", self.feed_id, e);
                None
            }
        };
        let output = annotated.as_ref().unwrap_or(&frame);
        let jpeg = encode_jpeg(output, self.config.jpeg_quality).unwrap_or_else(|e| {
            warn!("Frame encoding failed on {}: {}", self.feed_id, e);
            Vec::new()
        });
        let annotate_ms = ms_since(annotate_started);

        let now = Instant::now();
        if let Some(last) = self.last_processed {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant = 1.0 / dt;
                self.fps = if self.fps == 0.0 { instant } else { 0.9 * self.fps + 0.1 * instant };
            }
        }
        self.last_processed = Some(now);

        let message = ResultMessage {
            feed_id: self.feed_id.clone(),
            frame_index: index,
            annotated_frame: jpeg,
            frame_width: output.width(),
            frame_height: output.height(),
            metrics,
            tracks: tracks.into_values().collect(),
            timing: TimingStats {
                track_ms,
                annotate_ms,
                total_ms: ms_since(started),
                fps: self.fps,
                skipped_frames: self.skipped_frames,
            },
        };
        self.queue.push(WorkerEvent::Frame(Box::new(message)));
        Ok(())
    }

    fn resize(&self, frame: RgbImage) -> RgbImage {
        let (w, h) = self.config.frame_resolution;
        if frame.width() == 0 || frame.height() == 0 || w == 0 || h == 0 || frame.dimensions() == (w, h) {
            return frame;
        }
        imageops::resize(&frame, w, h, FilterType::Triangle)
    }

    /// Stops the source and frees the tracker. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.parts.source.stop();
        self.parts.tracker.release();
        debug!("Worker {} released its resources", self.feed_id);
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        self.release();
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
