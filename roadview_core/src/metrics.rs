//! Per-frame traffic metrics derived from a track snapshot.
//!
//! - **Lane occupancy**: vehicles per lane and their mean speed
//! - **Flow**: overall mean speed, stopped and speeding counts
//! - **Congestion**: coarse level from lane density and mean speed
//!
//! These feed both the overlay and the supervisor's KPI broadcasts.

use crate::types::{Behavior, TrackMap};
use serde::{Deserialize, Serialize};

/// Coarse congestion classification for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CongestionLevel {
    #[default]
    Free,
    Moderate,
    Heavy,
    Jammed,
}

impl CongestionLevel {
    /// Ordinal used when aggregating across feeds.
    pub fn severity(&self) -> u8 {
        match self {
            CongestionLevel::Free => 0,
            CongestionLevel::Moderate => 1,
            CongestionLevel::Heavy => 2,
            CongestionLevel::Jammed => 3,
        }
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneStats {
    /// 1-based lane index
    pub lane: u32,
    pub vehicle_count: usize,
    pub avg_speed_kmh: f64,
}

/// Metrics for one processed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedMetrics {
    pub vehicle_count: usize,
    pub lanes: Vec<LaneStats>,
    pub avg_speed_kmh: f64,
    pub stopped_count: usize,
    pub speeding_count: usize,
    pub congestion: CongestionLevel,
}

/// Thresholds for congestion classification
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// Vehicles per lane above which traffic is at least Moderate
    pub moderate_density: f64,
    /// Vehicles per lane above which traffic is at least Heavy
    pub heavy_density: f64,
    /// Mean speed under which traffic is at least Moderate (km/h)
    pub moderate_speed_kmh: f64,
    /// Mean speed under which traffic is at least Heavy (km/h)
    pub heavy_speed_kmh: f64,
    /// Mean speed under which traffic is Jammed (km/h)
    pub jammed_speed_kmh: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            moderate_density: 3.0,
            heavy_density: 6.0,
            moderate_speed_kmh: 40.0,
            heavy_speed_kmh: 20.0,
            jammed_speed_kmh: 5.0,
        }
    }
}

/// Computes lane, speed and congestion metrics for a snapshot.
pub fn compute_metrics(tracks: &TrackMap, num_lanes: u32, config: &CongestionConfig) -> FeedMetrics {
    let num_lanes = num_lanes.max(1);
    let mut lanes: Vec<LaneStats> = (1..=num_lanes)
        .map(|lane| LaneStats {
            lane,
            ..LaneStats::default()
        })
        .collect();
    let mut lane_speed_sums = vec![0.0; num_lanes as usize];

    let mut speed_sum = 0.0;
    let mut stopped_count = 0;
    let mut speeding_count = 0;

    for track in tracks.values() {
        speed_sum += track.speed_kmh;
        match track.behavior {
            Behavior::Stopped => stopped_count += 1,
            Behavior::Speeding => speeding_count += 1,
            _ => {}
        }
        if let Some(lane) = track.lane {
            let idx = (lane.clamp(1, num_lanes) - 1) as usize;
            lanes[idx].vehicle_count += 1;
            lane_speed_sums[idx] += track.speed_kmh;
        }
    }

    for (stats, sum) in lanes.iter_mut().zip(lane_speed_sums) {
        if stats.vehicle_count > 0 {
            stats.avg_speed_kmh = sum / stats.vehicle_count as f64;
        }
    }

    let vehicle_count = tracks.len();
    let avg_speed_kmh = if vehicle_count > 0 {
        speed_sum / vehicle_count as f64
    } else {
        0.0
    };

    FeedMetrics {
        vehicle_count,
        lanes,
        avg_speed_kmh,
        stopped_count,
        speeding_count,
        congestion: classify_congestion(vehicle_count, avg_speed_kmh, num_lanes, config),
    }
}

/// Classifies congestion from density (vehicles per lane) and mean speed.
///
/// An empty road is always Free.
pub fn classify_congestion(
    vehicle_count: usize,
    avg_speed_kmh: f64,
    num_lanes: u32,
    config: &CongestionConfig,
) -> CongestionLevel {
    if vehicle_count == 0 {
        return CongestionLevel::Free;
    }
    let density = vehicle_count as f64 / num_lanes.max(1) as f64;

    if avg_speed_kmh < config.jammed_speed_kmh && density >= config.moderate_density {
        CongestionLevel::Jammed
    } else if density >= config.heavy_density || avg_speed_kmh < config.heavy_speed_kmh {
        CongestionLevel::Heavy
    } else if density >= config.moderate_density || avg_speed_kmh < config.moderate_speed_kmh {
        CongestionLevel::Moderate
    } else {
        CongestionLevel::Free
    }
}

/// Timing of one worker iteration (milliseconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    /// Detection + tracking
    pub track_ms: f64,
    /// Overlay rendering + encoding
    pub annotate_ms: f64,
    /// Whole iteration, including resize
    pub total_ms: f64,
    /// Exponentially smoothed processed frames per second
    pub fps: f64,
    /// Frames skipped by the frame-skip policy so far
    pub skipped_frames: u64,
}
