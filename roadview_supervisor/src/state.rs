//! Feed lifecycle states and the legal-transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl FeedStatus {
    pub const ALL: [FeedStatus; 4] = [
        FeedStatus::Stopped,
        FeedStatus::Starting,
        FeedStatus::Running,
        FeedStatus::Error,
    ];

    /// Whether `self -> to` is one of the six legal transitions.
    pub fn can_transition_to(self, to: FeedStatus) -> bool {
        use FeedStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Error)
                | (Running, Stopped)
                | (Error, Stopped)
        )
    }

    /// Starting or Running: the feed holds (or is acquiring) a worker.
    pub fn is_active(self) -> bool {
        matches!(self, FeedStatus::Starting | FeedStatus::Running)
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedStatus::Stopped => "stopped",
            FeedStatus::Starting => "starting",
            FeedStatus::Running => "running",
            FeedStatus::Error => "error",
        };
        f.write_str(s)
    }
}
