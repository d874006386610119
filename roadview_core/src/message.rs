//! Messages a worker emits to its supervisor.

use crate::metrics::{FeedMetrics, TimingStats};
use crate::types::TrackSnapshot;
use serde::{Deserialize, Serialize};

/// One processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub feed_id: String,
    pub frame_index: u64,
    /// JPEG-encoded annotated frame (or the raw frame if annotation failed)
    pub annotated_frame: Vec<u8>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub metrics: FeedMetrics,
    pub tracks: Vec<TrackSnapshot>,
    pub timing: TimingStats,
}

/// Why a worker loop returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// The source ran out of frames
    EndOfStream,
    /// The stop flag was observed
    Stopped,
    /// Unrecoverable failure
    Failed(String),
}

/// Event stream from a worker, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Resources are open and the loop is about to read its first frame
    Ready { feed_id: String },
    Frame(Box<ResultMessage>),
    /// Clean termination (end of stream or requested stop)
    Finished { feed_id: String, reason: WorkerExit },
    /// Fatal failure; the worker has stopped
    Fatal { feed_id: String, reason: String },
}

impl WorkerEvent {
    pub fn feed_id(&self) -> &str {
        match self {
            WorkerEvent::Ready { feed_id }
            | WorkerEvent::Finished { feed_id, .. }
            | WorkerEvent::Fatal { feed_id, .. } => feed_id,
            WorkerEvent::Frame(msg) => &msg.feed_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Finished { .. } | WorkerEvent::Fatal { .. })
    }
}
