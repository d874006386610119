//! Common types for the RoadView environment abstraction.

use serde::{Deserialize, Serialize};

/// A point-in-time sample of host resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    /// Global CPU usage across all cores, 0.0 - 100.0
    pub cpu_percent: f32,

    /// Used memory as a share of total memory, 0.0 - 100.0
    pub memory_percent: f32,
}

impl SystemLoad {
    /// Creates a load sample from raw percentages (clamped to 0..=100).
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
        }
    }

    /// An idle host; useful as a default for tests.
    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl std::fmt::Display for SystemLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu={:.1}% mem={:.1}%", self.cpu_percent, self.memory_percent)
    }
}
