//! The TRACKING Engine - per-feed multi-object vehicle tracker
//!
//! Keeps one evolving `Track` per vehicle seen on a single feed by running
//! a 6-stage pipeline on every frame:
//! 1. Detection (external `Detector`, failures absorbed)
//! 2. Prediction (constant-velocity Kalman, `dt` clamped to [0.01, 1.0] s)
//! 3. Association (k-d tree nearest neighbor, greedy first-come claim)
//! 4. Update (Kalman correction, speed, lane, behavior, best-effort OCR)
//! 5. Birth (unclaimed detections above the noise floor)
//! 6. Eviction (stale tracks, then oldest-first down to the capacity limit)

use crate::detector::Detector;
use crate::kalman::{KalmanConfig, KalmanState};
use crate::kdtree::KdTree;
use crate::ocr::PlateReader;
use crate::types::{BBox, Behavior, Detection, TrackMap, TrackSnapshot, UNKNOWN_PLATE};
use image::RgbImage;
use roadview_env::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the TrackingEngine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Hard cap on simultaneously live tracks (default: 50)
    pub max_active_tracks: usize,

    /// Seconds without a match before a track is dropped (default: 2.0)
    pub track_timeout_secs: f64,

    /// Maximum pixel distance for associating a detection (default: 50)
    pub proximity_threshold_px: f64,

    /// Minimum detector confidence (default: 0.4)
    pub confidence_threshold: f32,

    /// Classes forwarded to the detector; empty means all (default: car, motorcycle, bus, truck)
    pub class_filter: Vec<u32>,

    /// Number of lanes the frame width is divided into (default: 3)
    pub num_lanes: u32,

    /// Image-plane scale used for speed conversion (default: 8 px/m)
    pub pixels_per_meter: f64,

    /// Speeding threshold in km/h (default: 60)
    pub speed_limit_kmh: f64,

    /// Below this speed a vehicle counts as stopped (default: 3 km/h)
    pub stopped_speed_kmh: f64,

    /// Acceleration that flags Accelerating/Decelerating (default: 2 m/s²)
    pub accel_threshold_mps2: f64,

    /// OCR is only attempted on frames divisible by this (default: 15)
    pub ocr_interval_frames: u64,

    /// OCR attempts per track before giving up (default: 3)
    pub max_ocr_attempts: u32,

    /// Unmatched detections smaller than this never start a track (default: 100 px²)
    pub min_bbox_area: f64,

    /// Length of the (frame, lane) ring per track (default: 30)
    pub lane_history_len: usize,

    /// Samples in the rolling speed average (default: 5)
    pub speed_history_len: usize,

    /// Kalman noise model
    pub kalman: KalmanConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_active_tracks: 50,
            track_timeout_secs: 2.0,
            proximity_threshold_px: 50.0,
            confidence_threshold: 0.4,
            class_filter: vec![2, 3, 5, 7],
            num_lanes: 3,
            pixels_per_meter: 8.0,
            speed_limit_kmh: 60.0,
            stopped_speed_kmh: 3.0,
            accel_threshold_mps2: 2.0,
            ocr_interval_frames: 15,
            max_ocr_attempts: 3,
            min_bbox_area: 100.0,
            lane_history_len: 30,
            speed_history_len: 5,
            kalman: KalmanConfig::default(),
        }
    }
}

/// Per-call thresholds for `detect_and_track`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameThresholds {
    pub confidence: f32,
    pub proximity_px: f64,
}

impl From<&TrackingConfig> for FrameThresholds {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            confidence: config.confidence_threshold,
            proximity_px: config.proximity_threshold_px,
        }
    }
}

/// Lower/upper bound on the Kalman prediction step, in seconds.
pub const MIN_DT: f64 = 0.01;
pub const MAX_DT: f64 = 1.0;

// ============================================================================
// TRACK (Internal State)
// ============================================================================

/// One tracked vehicle, owned by the engine that created it.
#[derive(Debug, Clone)]
pub struct Track {
    /// `<feed_id>-<sequence>`
    pub id: String,

    /// Numeric part of the ID; strictly increasing per engine
    pub sequence: u64,

    pub bbox: BBox,
    pub kalman: KalmanState,

    /// 1-based lane index, `None` until the first lane estimate
    pub lane: Option<u32>,

    /// Bounded ring of (frame_index, lane)
    pub lane_history: VecDeque<(u64, u32)>,

    /// Rolling-average speed
    pub speed_kmh: f64,

    /// Bounded ring of instantaneous speed samples (km/h)
    pub speed_history: VecDeque<f64>,

    pub behavior: Behavior,
    pub license_plate: Option<String>,
    pub plate_attempts: u32,

    /// Clock readings (seconds)
    pub first_seen: f64,
    pub last_seen: f64,

    pub class_id: u32,
}

impl Track {
    fn snapshot(&self, now: f64) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id.clone(),
            bbox: self.bbox,
            center: self.kalman.position(),
            velocity: self.kalman.velocity(),
            lane: self.lane,
            speed_kmh: self.speed_kmh,
            behavior: self.behavior,
            license_plate: self
                .license_plate
                .clone()
                .unwrap_or_else(|| UNKNOWN_PLATE.to_string()),
            class_id: self.class_id,
            age_secs: (now - self.first_seen).max(0.0),
        }
    }

    fn record_lane(&mut self, frame_index: u64, lane: u32, capacity: usize) {
        if self.lane_history.len() >= capacity.max(1) {
            self.lane_history.pop_front();
        }
        self.lane_history.push_back((frame_index, lane));
        self.lane = Some(lane);
    }
}

// ============================================================================
// TRACKING ENGINE
// ============================================================================

/// Stateful multi-object tracker for one feed.
///
/// Track IDs combine the feed ID with a counter owned by this instance, so
/// engines running in different worker processes never collide.
pub struct TrackingEngine {
    feed_id: String,
    config: TrackingConfig,
    detector: Box<dyn Detector>,
    plate_reader: Box<dyn PlateReader>,
    clock: Arc<dyn Clock>,

    /// Live tracks in insertion order (association iterates in this order)
    tracks: Vec<Track>,

    /// Last issued sequence number
    next_sequence: u64,
}

impl TrackingEngine {
    pub fn new(
        feed_id: impl Into<String>,
        config: TrackingConfig,
        detector: Box<dyn Detector>,
        plate_reader: Box<dyn PlateReader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            config,
            detector,
            plate_reader,
            clock,
            tracks: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Runs one frame through the full pipeline and returns a snapshot of
    /// every live track.
    ///
    /// Detector, OCR and per-track update failures are logged and absorbed;
    /// only an unusable frame is reported as an error.
    pub fn detect_and_track(
        &mut self,
        frame: &RgbImage,
        frame_index: u64,
        thresholds: &FrameThresholds,
    ) -> Result<TrackMap, TrackingError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(TrackingError::EmptyFrame);
        }
        let now = self.clock.now_secs();

        // Stage 1: Detection
        let detections = match self.detector.predict(
            frame,
            thresholds.confidence,
            &self.config.class_filter,
        ) {
            Ok(detections) => detections,
            Err(e) => {
                warn!(feed = %self.feed_id, frame = frame_index, error = %e, "Detector failed, keeping current tracks");
                return Ok(self.snapshot_at(now));
            }
        };

        // Stage 2: Prediction
        self.predict_all(now);

        // Stage 3: Association
        let (assignments, claimed) = self.associate(&detections, thresholds.proximity_px);

        // Stage 4: Update
        let frame_width = frame.width() as f64;
        for (track_idx, det_idx) in assignments {
            let track = &mut self.tracks[track_idx];
            if let Err(e) = Self::update_track(
                track,
                &detections[det_idx],
                frame,
                frame_index,
                now,
                frame_width,
                &self.config,
                self.plate_reader.as_mut(),
            ) {
                warn!(feed = %self.feed_id, track = %track.id, error = %e, "Track update failed, skipping for this frame");
            }
        }

        // Stage 5: Birth
        for (det_idx, detection) in detections.iter().enumerate() {
            if claimed[det_idx] || detection.bbox.area() <= self.config.min_bbox_area {
                continue;
            }
            if self.tracks.len() >= self.config.max_active_tracks {
                debug!(feed = %self.feed_id, "Track capacity reached, ignoring new detection");
                break;
            }
            self.spawn_track(detection, frame_index, frame_width, now);
        }

        // Stage 6: Eviction
        self.evict(now);

        Ok(self.snapshot_at(now))
    }

    // ========================================================================
    // PIPELINE STAGES
    // ========================================================================

    fn predict_all(&mut self, now: f64) {
        for track in &mut self.tracks {
            let dt = (now - track.last_seen).clamp(MIN_DT, MAX_DT);
            track.kalman.predict(dt);
        }
    }

    /// Greedy nearest-neighbor association.
    ///
    /// Tracks are visited in insertion order; each claims its nearest
    /// detection if it is within `proximity_px` and not yet claimed. A track
    /// whose nearest detection is already taken stays unmatched.
    fn associate(&self, detections: &[Detection], proximity_px: f64) -> (Vec<(usize, usize)>, Vec<bool>) {
        let mut claimed = vec![false; detections.len()];
        let mut assignments = Vec::new();

        if detections.is_empty() {
            return (assignments, claimed);
        }

        let centers: Vec<[f64; 2]> = detections.iter().map(|d| d.center).collect();
        let index = KdTree::build(&centers);

        for (track_idx, track) in self.tracks.iter().enumerate() {
            if let Some((det_idx, distance)) = index.nearest(track.kalman.position()) {
                if distance < proximity_px && !claimed[det_idx] {
                    claimed[det_idx] = true;
                    assignments.push((track_idx, det_idx));
                }
            }
        }

        (assignments, claimed)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_track(
        track: &mut Track,
        detection: &Detection,
        frame: &RgbImage,
        frame_index: u64,
        now: f64,
        frame_width: f64,
        config: &TrackingConfig,
        plate_reader: &mut dyn PlateReader,
    ) -> Result<(), TrackingError> {
        // Nothing on the track changes until the update is known to be usable
        let mut kalman = track.kalman.clone();
        kalman.update(detection.center)?;

        // Speed: rolling average of |v| converted to km/h
        let instant_kmh = kalman.speed_px() / config.pixels_per_meter * 3.6;
        if !instant_kmh.is_finite() {
            return Err(TrackingError::NonFiniteState);
        }

        track.kalman = kalman;
        track.bbox = detection.bbox;
        track.last_seen = now;
        track.class_id = detection.class_id;
        let recent: Vec<f64> = track.speed_history.iter().rev().take(3).copied().collect();
        let previous_avg = if recent.is_empty() {
            None
        } else {
            Some(recent.iter().sum::<f64>() / recent.len() as f64)
        };
        if track.speed_history.len() >= config.speed_history_len.max(1) {
            track.speed_history.pop_front();
        }
        track.speed_history.push_back(instant_kmh);
        track.speed_kmh = track.speed_history.iter().sum::<f64>() / track.speed_history.len() as f64;

        // Lane
        let previous_lane = track.lane;
        let lane = lane_for(track.kalman.position()[0], frame_width, config.num_lanes);
        track.record_lane(frame_index, lane, config.lane_history_len);
        let lane_changed = previous_lane.is_some_and(|prev| prev != lane);

        track.behavior = classify_behavior(
            track.speed_kmh,
            instant_kmh,
            previous_avg,
            lane_changed,
            config,
        );

        Self::try_read_plate(track, frame, frame_index, config, plate_reader);
        Ok(())
    }

    fn try_read_plate(
        track: &mut Track,
        frame: &RgbImage,
        frame_index: u64,
        config: &TrackingConfig,
        plate_reader: &mut dyn PlateReader,
    ) {
        if track.license_plate.is_some()
            || track.plate_attempts >= config.max_ocr_attempts
            || config.ocr_interval_frames == 0
            || frame_index % config.ocr_interval_frames != 0
        {
            return;
        }
        let Some(roi) = crop_roi(frame, &track.bbox) else {
            return;
        };

        track.plate_attempts += 1;
        match plate_reader.read_plate(&roi) {
            Ok(Some(text)) if !text.trim().is_empty() => {
                debug!(track = %track.id, plate = %text.trim(), "Plate resolved");
                track.license_plate = Some(text.trim().to_string());
            }
            Ok(_) => {}
            Err(e) => {
                debug!(track = %track.id, attempt = track.plate_attempts, error = %e, "OCR attempt failed");
            }
        }
    }

    fn spawn_track(&mut self, detection: &Detection, frame_index: u64, frame_width: f64, now: f64) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;

        let mut track = Track {
            id: format!("{}-{}", self.feed_id, sequence),
            sequence,
            bbox: detection.bbox,
            kalman: KalmanState::new(detection.center, self.config.kalman),
            lane: None,
            lane_history: VecDeque::new(),
            speed_kmh: 0.0,
            speed_history: VecDeque::new(),
            behavior: Behavior::Unknown,
            license_plate: None,
            plate_attempts: 0,
            first_seen: now,
            last_seen: now,
            class_id: detection.class_id,
        };
        let lane = lane_for(detection.center[0], frame_width, self.config.num_lanes);
        track.record_lane(frame_index, lane, self.config.lane_history_len);

        debug!(feed = %self.feed_id, track = %track.id, "New track");
        self.tracks.push(track);
    }

    /// Removes stale tracks, then the least recently seen ones until the
    /// capacity limit holds.
    fn evict(&mut self, now: f64) {
        let timeout = self.config.track_timeout_secs;
        self.tracks.retain(|t| now - t.last_seen <= timeout);

        let max = self.config.max_active_tracks;
        if self.tracks.len() > max {
            let excess = self.tracks.len() - max;
            let mut by_age: Vec<(f64, u64)> = self
                .tracks
                .iter()
                .map(|t| (t.last_seen, t.sequence))
                .collect();
            by_age.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            let doomed: HashSet<u64> = by_age.iter().take(excess).map(|(_, seq)| *seq).collect();
            self.tracks.retain(|t| !doomed.contains(&t.sequence));
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Snapshot of all live tracks at the current clock reading.
    pub fn snapshot(&self) -> TrackMap {
        self.snapshot_at(self.clock.now_secs())
    }

    fn snapshot_at(&self, now: f64) -> TrackMap {
        self.tracks
            .iter()
            .map(|t| (t.id.clone(), t.snapshot(now)))
            .collect()
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Live tracks in insertion order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn get_track(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Sequence number of the most recently created track (0 if none).
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Drops all tracks. The ID counter is kept so IDs are never reused.
    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Maps an x coordinate to a 1-based lane index.
pub fn lane_for(center_x: f64, frame_width: f64, num_lanes: u32) -> u32 {
    let num_lanes = num_lanes.max(1);
    let lane_width = frame_width / num_lanes as f64;
    if !(lane_width > 0.0) || !center_x.is_finite() {
        return 1;
    }
    let lane = (center_x / lane_width).floor() as i64 + 1;
    lane.clamp(1, num_lanes as i64) as u32
}

/// Behavior precedence: Stopped > Speeding > Accelerating/Decelerating >
/// LaneChanging > Moving.
///
/// `instant_kmh` is compared with `previous_avg` (mean of the preceding
/// speed samples); the km/h threshold is the speed gained in one second at
/// `accel_threshold_mps2`.
pub fn classify_behavior(
    speed_kmh: f64,
    instant_kmh: f64,
    previous_avg: Option<f64>,
    lane_changed: bool,
    config: &TrackingConfig,
) -> Behavior {
    if speed_kmh < config.stopped_speed_kmh {
        return Behavior::Stopped;
    }
    if speed_kmh > config.speed_limit_kmh {
        return Behavior::Speeding;
    }
    if let Some(avg) = previous_avg {
        let threshold_kmh = config.accel_threshold_mps2 * 3.6;
        let delta = instant_kmh - avg;
        if delta > threshold_kmh {
            return Behavior::Accelerating;
        }
        if delta < -threshold_kmh {
            return Behavior::Decelerating;
        }
    }
    if lane_changed {
        return Behavior::LaneChanging;
    }
    Behavior::Moving
}

/// Crops a box out of the frame, clamped to the frame bounds.
fn crop_roi(frame: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let (w, h) = (frame.width() as f64, frame.height() as f64);
    let x0 = bbox.x.max(0.0).floor();
    let y0 = bbox.y.max(0.0).floor();
    let x1 = (bbox.x + bbox.width).min(w).ceil();
    let y1 = (bbox.y + bbox.height).min(h).ceil();
    if !(x1 > x0 && y1 > y0) {
        return None;
    }
    let roi = image::imageops::crop_imm(
        frame,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();
    Some(roi)
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that can occur during tracking operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackingError {
    #[error("Frame has no pixels")]
    EmptyFrame,

    #[error("Innovation covariance is not positive definite")]
    SingularCovariance,

    #[error("Filter produced a non-finite state")]
    NonFiniteState,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::ocr::OcrError;
    use proptest::prelude::*;
    use roadview_env::ManualClock;
    use std::sync::Mutex;
    use std::time::Duration;

    type Script = Arc<Mutex<VecDeque<Result<Vec<Detection>, DetectorError>>>>;

    /// Detector that replays scripted outputs, then reports nothing.
    struct ScriptedDetector {
        script: Script,
    }

    impl Detector for ScriptedDetector {
        fn predict(&mut self, _: &RgbImage, _: f32, _: &[u32]) -> Result<Vec<Detection>, DetectorError> {
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    struct ScriptedReader {
        replies: VecDeque<Result<Option<String>, OcrError>>,
        calls: Arc<Mutex<u32>>,
    }

    impl PlateReader for ScriptedReader {
        fn read_plate(&mut self, _: &RgbImage) -> Result<Option<String>, OcrError> {
            *self.calls.lock().unwrap() += 1;
            self.replies.pop_front().unwrap_or(Ok(None))
        }
    }

    struct Harness {
        engine: TrackingEngine,
        script: Script,
        clock: ManualClock,
        frame: RgbImage,
        frame_index: u64,
    }

    impl Harness {
        fn new(config: TrackingConfig) -> Self {
            Self::with_reader(config, Box::new(crate::ocr::NoPlateReader))
        }

        fn with_reader(config: TrackingConfig, reader: Box<dyn PlateReader>) -> Self {
            let script: Script = Arc::new(Mutex::new(VecDeque::new()));
            let clock = ManualClock::new();
            let engine = TrackingEngine::new(
                "cam",
                config,
                Box::new(ScriptedDetector { script: script.clone() }),
                reader,
                Arc::new(clock.clone()),
            );
            Self {
                engine,
                script,
                clock,
                frame: RgbImage::new(300, 200),
                frame_index: 0,
            }
        }

        /// Advances the clock by 0.1 s and runs one frame.
        fn step(&mut self, detections: Vec<Detection>) -> TrackMap {
            self.step_result(Ok(detections))
        }

        fn step_result(&mut self, detections: Result<Vec<Detection>, DetectorError>) -> TrackMap {
            self.clock.advance(Duration::from_millis(100));
            self.frame_index += 1;
            self.script.lock().unwrap().push_back(detections);
            let thresholds = FrameThresholds::from(self.engine.config());
            self.engine
                .detect_and_track(&self.frame, self.frame_index, &thresholds)
                .unwrap()
        }
    }

    fn det(x: f64, y: f64) -> Detection {
        Detection::from_bbox(BBox::centered([x, y], 20.0, 20.0), 0.9, 2)
    }

    #[test]
    fn test_new_detection_creates_track() {
        let mut h = Harness::new(TrackingConfig::default());
        let tracks = h.step(vec![det(100.0, 100.0)]);

        assert_eq!(tracks.len(), 1);
        let t = tracks.get("cam-1").unwrap();
        assert_eq!(t.center, [100.0, 100.0]);
        assert_eq!(t.behavior, Behavior::Unknown);
        assert_eq!(t.license_plate, UNKNOWN_PLATE);
        assert_eq!(t.lane, Some(2));
    }

    #[test]
    fn test_nearer_detection_claimed_other_spawns() {
        let mut h = Harness::new(TrackingConfig::default());
        h.step(vec![det(100.0, 100.0)]);

        // Both within the 50 px proximity threshold
        let tracks = h.step(vec![det(130.0, 100.0), det(110.0, 100.0)]);

        assert_eq!(tracks.len(), 2);
        let original = tracks.get("cam-1").unwrap();
        assert!(original.center[0] > 100.0 && original.center[0] <= 110.0);
        let spawned = tracks.get("cam-2").unwrap();
        assert_eq!(spawned.center, [130.0, 100.0]);
    }

    #[test]
    fn test_small_unmatched_detection_is_noise() {
        let mut h = Harness::new(TrackingConfig::default());
        let tiny = Detection::from_bbox(BBox::centered([50.0, 50.0], 5.0, 5.0), 0.9, 2);
        let tracks = h.step(vec![tiny]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_far_detection_not_associated() {
        let mut h = Harness::new(TrackingConfig::default());
        h.step(vec![det(20.0, 20.0)]);
        let tracks = h.step(vec![det(250.0, 150.0)]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks["cam-1"].center, [20.0, 20.0]);
    }

    #[test]
    fn test_detector_failure_keeps_state() {
        let mut h = Harness::new(TrackingConfig::default());
        let before = h.step(vec![det(100.0, 100.0)]);
        let after = h.step_result(Err(DetectorError::Inference("boom".into())));

        assert_eq!(after.len(), 1);
        assert_eq!(after["cam-1"].center, before["cam-1"].center);
    }

    #[test]
    fn test_stale_tracks_evicted() {
        let mut h = Harness::new(TrackingConfig {
            track_timeout_secs: 0.5,
            ..TrackingConfig::default()
        });
        h.step(vec![det(100.0, 100.0)]);
        for _ in 0..4 {
            h.step(vec![]);
        }
        assert_eq!(h.engine.track_count(), 1);
        h.step(vec![]);
        let tracks = h.step(vec![]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_capacity_limits_births() {
        let mut h = Harness::new(TrackingConfig {
            max_active_tracks: 3,
            ..TrackingConfig::default()
        });
        let tracks = h.step((0..5).map(|i| det(20.0 + 60.0 * i as f64, 100.0)).collect());
        assert_eq!(tracks.len(), 3);
    }

    #[test]
    fn test_update_failure_skips_track_but_keeps_it() {
        let mut config = TrackingConfig::default();
        // Negative measurement noise makes the innovation covariance indefinite
        config.kalman.measurement_variance = -1.0e6;
        let mut h = Harness::new(config);

        h.step(vec![det(100.0, 100.0)]);
        let last_seen = h.engine.get_track("cam-1").unwrap().last_seen;

        let tracks = h.step(vec![det(105.0, 100.0)]);

        assert_eq!(tracks.len(), 1);
        let track = h.engine.get_track("cam-1").unwrap();
        assert_eq!(track.last_seen, last_seen);
        assert!(track.speed_history.is_empty());
    }

    #[test]
    fn test_non_finite_speed_leaves_track_untouched() {
        let config = TrackingConfig {
            pixels_per_meter: 0.0,
            ..TrackingConfig::default()
        };
        let mut h = Harness::new(config);

        h.step(vec![det(100.0, 100.0)]);
        let before = h.engine.get_track("cam-1").unwrap().clone();

        let tracks = h.step(vec![det(120.0, 100.0)]);

        assert_eq!(tracks.len(), 1);
        let track = h.engine.get_track("cam-1").unwrap();
        assert_eq!(track.last_seen, before.last_seen);
        assert_eq!(track.bbox, before.bbox);
        assert!(track.speed_history.is_empty());
        assert_eq!(track.lane_history.len(), before.lane_history.len());
    }

    #[test]
    fn test_fixed_detection_converges_velocity_to_zero() {
        let mut h = Harness::new(TrackingConfig::default());
        let mut tracks = TrackMap::new();
        for _ in 0..50 {
            tracks = h.step(vec![det(150.0, 100.0)]);
        }
        let t = &tracks["cam-1"];
        assert!(t.velocity[0].abs() < 1e-3 && t.velocity[1].abs() < 1e-3);
        assert_eq!(t.behavior, Behavior::Stopped);
        assert!(t.speed_kmh < 0.01);
    }

    #[test]
    fn test_constant_motion_speed_and_behavior() {
        let mut h = Harness::new(TrackingConfig::default());
        let mut tracks = TrackMap::new();
        // 10 px per 0.1 s along y = 100 px/s = 12.5 m/s = 45 km/h
        for k in 0..40 {
            tracks = h.step(vec![det(150.0, 10.0 + 10.0 * k as f64)]);
        }
        let t = &tracks["cam-1"];
        assert!((t.speed_kmh - 45.0).abs() < 5.0, "speed = {}", t.speed_kmh);
        assert_eq!(t.behavior, Behavior::Moving);
        assert_eq!(t.lane, Some(2));
    }

    #[test]
    fn test_speeding_detected() {
        let mut h = Harness::new(TrackingConfig {
            proximity_threshold_px: 80.0,
            ..TrackingConfig::default()
        });
        h.frame = RgbImage::new(300, 1000);
        let mut tracks = TrackMap::new();
        // 25 px per 0.1 s = 250 px/s = 112.5 km/h
        for k in 0..30 {
            tracks = h.step(vec![det(50.0, 10.0 + 25.0 * k as f64)]);
        }
        assert_eq!(tracks["cam-1"].behavior, Behavior::Speeding);
    }

    #[test]
    fn test_ocr_resolves_and_stops_trying() {
        let calls = Arc::new(Mutex::new(0));
        let reader = ScriptedReader {
            replies: VecDeque::from(vec![
                Err(OcrError::Backend("no engine".into())),
                Ok(Some(" ABC123 ".to_string())),
            ]),
            calls: calls.clone(),
        };
        let mut h = Harness::with_reader(
            TrackingConfig {
                ocr_interval_frames: 1,
                ..TrackingConfig::default()
            },
            Box::new(reader),
        );

        let mut tracks = TrackMap::new();
        for _ in 0..6 {
            tracks = h.step(vec![det(100.0, 100.0)]);
        }
        assert_eq!(tracks["cam-1"].license_plate, "ABC123");
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_ocr_attempts_are_bounded() {
        let calls = Arc::new(Mutex::new(0));
        let reader = ScriptedReader {
            replies: VecDeque::new(),
            calls: calls.clone(),
        };
        let mut h = Harness::with_reader(
            TrackingConfig {
                ocr_interval_frames: 2,
                max_ocr_attempts: 3,
                ..TrackingConfig::default()
            },
            Box::new(reader),
        );
        for _ in 0..20 {
            h.step(vec![det(100.0, 100.0)]);
        }
        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(h.engine.get_track("cam-1").unwrap().plate_attempts, 3);
    }

    #[test]
    fn test_empty_frame_is_error() {
        let mut h = Harness::new(TrackingConfig::default());
        let thresholds = FrameThresholds::from(h.engine.config());
        let result = h.engine.detect_and_track(&RgbImage::new(0, 0), 1, &thresholds);
        assert_eq!(result, Err(TrackingError::EmptyFrame));
    }

    #[test]
    fn test_lane_for() {
        assert_eq!(lane_for(5.0, 300.0, 3), 1);
        assert_eq!(lane_for(150.0, 300.0, 3), 2);
        assert_eq!(lane_for(250.0, 300.0, 3), 3);
        assert_eq!(lane_for(299.9, 300.0, 3), 3);
        assert_eq!(lane_for(450.0, 300.0, 3), 3);
        assert_eq!(lane_for(-10.0, 300.0, 3), 1);
    }

    #[test]
    fn test_behavior_precedence() {
        let c = TrackingConfig::default();
        assert_eq!(classify_behavior(1.0, 50.0, Some(0.0), true, &c), Behavior::Stopped);
        assert_eq!(classify_behavior(80.0, 120.0, Some(40.0), true, &c), Behavior::Speeding);
        assert_eq!(classify_behavior(40.0, 50.0, Some(30.0), true, &c), Behavior::Accelerating);
        assert_eq!(classify_behavior(40.0, 20.0, Some(40.0), true, &c), Behavior::Decelerating);
        assert_eq!(classify_behavior(40.0, 41.0, Some(40.0), true, &c), Behavior::LaneChanging);
        assert_eq!(classify_behavior(40.0, 41.0, Some(40.0), false, &c), Behavior::Moving);
        assert_eq!(classify_behavior(40.0, 40.0, None, false, &c), Behavior::Moving);
    }

    #[test]
    fn test_clear_keeps_id_counter() {
        let mut h = Harness::new(TrackingConfig::default());
        h.step(vec![det(100.0, 100.0)]);
        h.engine.clear();
        let tracks = h.step(vec![det(100.0, 100.0)]);
        assert!(tracks.contains_key("cam-2"));
    }

    fn detections_strategy() -> impl Strategy<Value = Vec<Vec<(f64, f64)>>> {
        prop::collection::vec(
            prop::collection::vec((0.0f64..300.0, 0.0f64..200.0), 0..12),
            1..25,
        )
    }

    proptest! {
        #[test]
        fn prop_ids_increase_and_capacity_holds(frames in detections_strategy(), max in 1usize..8) {
            let mut h = Harness::new(TrackingConfig {
                max_active_tracks: max,
                ..TrackingConfig::default()
            });
            let mut seen: HashSet<String> = HashSet::new();
            let mut last_seq = 0u64;

            for frame in frames {
                let tracks = h.step(frame.into_iter().map(|(x, y)| det(x, y)).collect());
                prop_assert!(tracks.len() <= max);

                for track in h.engine.tracks() {
                    if seen.insert(track.id.clone()) {
                        // Newly observed IDs must be larger than everything before
                        prop_assert!(track.sequence > last_seq);
                        last_seq = track.sequence;
                    }
                    prop_assert_eq!(&track.id, &format!("cam-{}", track.sequence));
                }
            }
        }
    }
}
