//! Error taxonomy for supervisor operations.

use crate::state::FeedStatus;
use roadview_core::SourceError;
use roadview_env::EnvError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid source: {0}")]
    InvalidSource(#[from] SourceError),

    #[error("Resource limit: memory at {memory_percent:.1}% (limit {limit_percent:.1}%)")]
    ResourceLimit {
        memory_percent: f32,
        limit_percent: f32,
    },

    #[error("Admission probe failed: {0}")]
    Probe(#[from] EnvError),

    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Invalid operation on {feed_id}: cannot go from {from} to {to}")]
    InvalidTransition {
        feed_id: String,
        from: FeedStatus,
        to: FeedStatus,
    },

    #[error("Feed is still active: {0}")]
    FeedActive(String),

    #[error("Worker launch failed: {0}")]
    WorkerLaunch(String),

    #[error("Worker runtime error: {0}")]
    WorkerRuntime(String),

    #[error("Process termination failed: {0}")]
    ProcessTermination(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}
