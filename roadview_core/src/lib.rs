//! RoadView Core - per-feed vehicle tracking and worker pipeline
//!
//! Each video feed is handled by one worker that owns:
//! 1. **A frame source**: image sequences, a synthetic road scene, or a
//!    capture device descriptor
//! 2. **A tracking engine**: Kalman prediction, k-d tree association,
//!    speed/lane/behavior inference and best-effort plate reading
//! 3. **A visualizer**: lane and track overlays, JPEG-encoded
//!
//! Results leave the worker through a bounded drop-oldest `ResultQueue`.

pub mod detector;
pub mod kalman;
pub mod kdtree;
pub mod message;
pub mod metrics;
pub mod ocr;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod tracking;
pub mod types;
pub mod visualizer;
pub mod worker;

// Re-export key types for convenience
pub use detector::{BlobDetector, Detector, DetectorError};
pub use message::{ResultMessage, WorkerEvent, WorkerExit};
pub use metrics::{CongestionLevel, FeedMetrics, LaneStats, TimingStats};
pub use ocr::{NoPlateReader, PlateReader};
pub use pipeline::{build_pipeline, PipelineConfig, WorkerSpec};
pub use queue::ResultQueue;
pub use source::{open_source, FeedSource, FrameRead, FrameSource, SourceError};
pub use tracking::{FrameThresholds, TrackingConfig, TrackingEngine, TrackingError};
pub use types::{BBox, Behavior, Detection, TrackMap, TrackSnapshot};
pub use visualizer::{OverlayRenderer, Visualizer, VisualizerError};
pub use worker::{FrameTracker, WorkerConfig, WorkerError, WorkerLoop, WorkerParts, WorkerSignals};
