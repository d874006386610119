//! Assembly of a complete worker from a serialisable spec.
//!
//! A `WorkerSpec` is all a worker needs to start, whether it runs on a
//! thread in the supervisor or in a separate `roadview worker` process.

use crate::detector::BlobDetector;
use crate::ocr::NoPlateReader;
use crate::queue::ResultQueue;
use crate::source::{open_source, FeedSource, SourceError};
use crate::tracking::{FrameThresholds, TrackingConfig, TrackingEngine};
use crate::visualizer::OverlayRenderer;
use crate::worker::{WorkerConfig, WorkerLoop, WorkerParts, WorkerSignals};
use crate::message::WorkerEvent;
use roadview_env::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tuning shared by every stage of a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub worker: WorkerConfig,
    pub tracking: TrackingConfig,
}

/// Everything needed to launch one feed's worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub feed_id: String,
    pub source: FeedSource,
    #[serde(default)]
    pub config: PipelineConfig,
}

impl WorkerSpec {
    pub fn new(feed_id: impl Into<String>, source: FeedSource, config: PipelineConfig) -> Self {
        Self {
            feed_id: feed_id.into(),
            source,
            config,
        }
    }

    /// Result queue sized for this worker.
    pub fn result_queue(&self) -> Arc<ResultQueue<WorkerEvent>> {
        Arc::new(ResultQueue::new(self.config.worker.result_queue_capacity))
    }

    /// Wraps already-built parts in a worker loop.
    pub fn into_loop(
        self,
        parts: WorkerParts,
        queue: Arc<ResultQueue<WorkerEvent>>,
        signals: Arc<WorkerSignals>,
    ) -> WorkerLoop {
        let thresholds = FrameThresholds::from(&self.config.tracking);
        WorkerLoop::new(self.feed_id, self.config.worker, thresholds, parts, queue, signals)
    }
}

/// Opens the source and builds the default tracker and renderer.
pub fn build_pipeline(spec: &WorkerSpec, clock: Arc<dyn Clock>) -> Result<WorkerParts, SourceError> {
    let source = open_source(&spec.source)?;
    let tracker = TrackingEngine::new(
        spec.feed_id.clone(),
        spec.config.tracking.clone(),
        Box::new(BlobDetector::default()),
        Box::new(NoPlateReader),
        clock,
    );
    Ok(WorkerParts {
        source,
        tracker: Box::new(tracker),
        visualizer: Box::new(OverlayRenderer::new(spec.config.tracking.num_lanes)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WorkerExit;
    use roadview_env::SystemClock;

    #[test]
    fn test_spec_json_defaults_missing_config() {
        let spec: WorkerSpec =
            serde_json::from_str(r#"{"feed_id":"cam-1","source":{"webcam":0}}"#).unwrap();
        assert_eq!(spec.source, FeedSource::Webcam(0));
        assert_eq!(spec.config.worker.max_consecutive_errors, 10);
        assert_eq!(spec.config.tracking.max_active_tracks, TrackingConfig::default().max_active_tracks);
    }

    #[test]
    fn test_unsupported_source_fails_to_build() {
        let spec = WorkerSpec::new("cam-1", FeedSource::Network("rtsp://x".into()), PipelineConfig::default());
        assert!(matches!(
            build_pipeline(&spec, Arc::new(SystemClock::new())),
            Err(SourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_synthetic_pipeline_runs_to_end_of_stream() {
        let spec = WorkerSpec::new(
            "sample",
            FeedSource::Synthetic {
                seed: 5,
                frames: Some(6),
                fps: 0.0,
            },
            PipelineConfig::default(),
        );
        let parts = build_pipeline(&spec, Arc::new(SystemClock::new())).unwrap();
        let queue = spec.result_queue();
        let mut worker = spec.into_loop(parts, queue.clone(), WorkerSignals::new());

        assert_eq!(worker.run(), WorkerExit::EndOfStream);
        let events = queue.drain();
        assert!(matches!(events.last(), Some(WorkerEvent::Finished { .. })));
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Frame(_))));
    }
}
