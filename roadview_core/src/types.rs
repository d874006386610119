//! Shared value types: boxes, detections, behaviors and track snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned bounding box in pixel coordinates (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Builds a box of the given size centered on `center`.
    pub fn centered(center: [f64; 2], width: f64, height: f64) -> Self {
        Self::new(center[0] - width / 2.0, center[1] - height / 2.0, width, height)
    }

    #[inline]
    pub fn center(&self) -> [f64; 2] {
        [self.x + self.width / 2.0, self.y + self.height / 2.0]
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Moves the box so its center sits on `center`, keeping its size.
    pub fn recenter(&mut self, center: [f64; 2]) {
        self.x = center[0] - self.width / 2.0;
        self.y = center[1] - self.height / 2.0;
    }
}

/// One detector output for one frame. Never outlives a matching pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Center of the box [x, y]
    pub center: [f64; 2],

    /// Detector confidence [0.0 - 1.0]
    pub confidence: f32,

    /// COCO-style class: 2=car, 3=motorcycle, 5=bus, 7=truck
    pub class_id: u32,

    pub bbox: BBox,
}

impl Detection {
    pub fn from_bbox(bbox: BBox, confidence: f32, class_id: u32) -> Self {
        Self {
            center: bbox.center(),
            confidence,
            class_id,
            bbox,
        }
    }
}

/// Driving behavior inferred from a track's speed and lane history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Behavior {
    #[default]
    Unknown,
    Stopped,
    Moving,
    Accelerating,
    Decelerating,
    Speeding,
    LaneChanging,
}

impl std::fmt::Display for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Behavior::Unknown => "unknown",
            Behavior::Stopped => "stopped",
            Behavior::Moving => "moving",
            Behavior::Accelerating => "accelerating",
            Behavior::Decelerating => "decelerating",
            Behavior::Speeding => "speeding",
            Behavior::LaneChanging => "lane_changing",
        };
        f.write_str(s)
    }
}

/// Plate text reported when OCR has not resolved anything yet.
pub const UNKNOWN_PLATE: &str = "unknown";

/// Immutable copy of a track, safe to hand across threads and processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: String,
    pub bbox: BBox,
    pub center: [f64; 2],
    /// Estimated velocity in px/s
    pub velocity: [f64; 2],
    pub lane: Option<u32>,
    pub speed_kmh: f64,
    pub behavior: Behavior,
    pub license_plate: String,
    pub class_id: u32,
    /// Seconds since the track was created
    pub age_secs: f64,
}

/// Tracks keyed by track ID, as returned by one tracking pass.
pub type TrackMap = BTreeMap<String, TrackSnapshot>;
