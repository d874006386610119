//! Error types for the RoadView environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Host load could not be sampled
    #[error("Probe error: {0}")]
    ProbeError(String),

    /// The host reported no memory at all (containers without a memory view)
    #[error("Host reported zero total memory")]
    NoMemoryInfo,
}

impl EnvError {
    /// Creates a probe error.
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::ProbeError(msg.into())
    }
}
