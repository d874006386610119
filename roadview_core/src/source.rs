//! Frame sources: where a worker's frames come from.
//!
//! A `FeedSource` is the serialisable descriptor handed to a worker; the
//! worker turns it into a live `FrameSource` with `open_source`.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Image extensions the file source decodes.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Resolution of the synthetic road scene.
pub const SYNTHETIC_WIDTH: u32 = 640;
pub const SYNTHETIC_HEIGHT: u32 = 360;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported source: {0}")]
    Unsupported(String),

    #[error("Invalid source descriptor: {0}")]
    Invalid(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Descriptor of a video feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    /// Directory of still images (played in file-name order) or one image
    File(PathBuf),
    /// Local capture device index
    Webcam(u32),
    /// Stream URL (rtsp/http)
    Network(String),
    /// Procedurally rendered road scene
    Synthetic {
        seed: u64,
        /// Frame count; `None` runs forever
        frames: Option<u64>,
        /// Pacing; 0 emits frames as fast as they are read
        fps: f32,
    },
}

impl FeedSource {
    /// The built-in scene used for the sample feed.
    pub fn sample() -> Self {
        FeedSource::Synthetic {
            seed: 7,
            frames: None,
            fps: 15.0,
        }
    }

    /// Checks the descriptor without opening it.
    ///
    /// File paths must exist; webcam and network descriptors are accepted
    /// as long as they are well formed.
    pub fn validate(&self) -> Result<(), SourceError> {
        match self {
            FeedSource::File(path) => {
                if !path.exists() {
                    return Err(SourceError::NotFound(path.clone()));
                }
                if path.is_file() && !has_image_extension(path) {
                    return Err(SourceError::Unsupported(format!(
                        "{} is not a supported image file",
                        path.display()
                    )));
                }
                Ok(())
            }
            FeedSource::Webcam(_) => Ok(()),
            FeedSource::Network(url) => {
                if url.trim().is_empty() {
                    Err(SourceError::Invalid("empty stream URL".to_string()))
                } else {
                    Ok(())
                }
            }
            FeedSource::Synthetic { fps, .. } => {
                if fps.is_finite() && *fps >= 0.0 {
                    Ok(())
                } else {
                    Err(SourceError::Invalid(format!("fps must be >= 0, got {fps}")))
                }
            }
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedSource::File(path) => write!(f, "file:{}", path.display()),
            FeedSource::Webcam(index) => write!(f, "webcam:{index}"),
            FeedSource::Network(url) => write!(f, "{url}"),
            FeedSource::Synthetic { seed, .. } => write!(f, "synthetic:{seed}"),
        }
    }
}

/// Parses the CLI form: `synthetic[:seed]`, `webcam:<n>`, a URL with a
/// scheme, or a file system path.
impl FromStr for FeedSource {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SourceError::Invalid("empty source".to_string()));
        }
        if s == "synthetic" {
            return Ok(FeedSource::sample());
        }
        if let Some(seed) = s.strip_prefix("synthetic:") {
            let seed = seed
                .parse()
                .map_err(|_| SourceError::Invalid(format!("bad synthetic seed: {seed}")))?;
            return Ok(FeedSource::Synthetic {
                seed,
                frames: None,
                fps: 15.0,
            });
        }
        if let Some(index) = s.strip_prefix("webcam:") {
            let index = index
                .parse()
                .map_err(|_| SourceError::Invalid(format!("bad webcam index: {index}")))?;
            return Ok(FeedSource::Webcam(index));
        }
        if s.contains("://") {
            return Ok(FeedSource::Network(s.to_string()));
        }
        Ok(FeedSource::File(PathBuf::from(s)))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Outcome of one read.
#[derive(Debug)]
pub enum FrameRead {
    Frame { index: u64, image: RgbImage },
    EndOfStream,
}

/// A live stream of frames.
///
/// `read` errors are transient: the stream may still produce frames
/// afterwards. Only `EndOfStream` (or `is_alive() == false`) means it is done.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<FrameRead, SourceError>;
    fn is_alive(&self) -> bool;
    fn stop(&mut self);
}

/// Opens a descriptor.
pub fn open_source(source: &FeedSource) -> Result<Box<dyn FrameSource>, SourceError> {
    source.validate()?;
    match source {
        FeedSource::File(path) => Ok(Box::new(ImageSequenceSource::open(path)?)),
        FeedSource::Synthetic { seed, frames, fps } => {
            Ok(Box::new(SyntheticSource::new(*seed, *frames, *fps)))
        }
        FeedSource::Webcam(index) => Err(SourceError::Unsupported(format!(
            "webcam:{index} (no capture backend compiled in)"
        ))),
        FeedSource::Network(url) => Err(SourceError::Unsupported(format!(
            "{url} (no stream decoder compiled in)"
        ))),
    }
}

// ============================================================================
// IMAGE SEQUENCE
// ============================================================================

/// Plays a directory of images, or a single image, once.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    cursor: usize,
    next_index: u64,
    stopped: bool,
}

impl ImageSequenceSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let paths = if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_image_extension(p))
                .collect();
            paths.sort();
            paths
        } else if has_image_extension(path) {
            vec![path.to_path_buf()]
        } else {
            return Err(SourceError::Unsupported(path.display().to_string()));
        };

        debug!("Opened image sequence {} ({} frames)", path.display(), paths.len());
        Ok(Self {
            paths,
            cursor: 0,
            next_index: 0,
            stopped: false,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn read(&mut self) -> Result<FrameRead, SourceError> {
        while !self.stopped && self.cursor < self.paths.len() {
            let path = &self.paths[self.cursor];
            self.cursor += 1;
            match image::open(path) {
                Ok(img) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    return Ok(FrameRead::Frame {
                        index,
                        image: img.to_rgb8(),
                    });
                }
                // A corrupt frame is not the end of the stream
                Err(e) => warn!("Skipping undecodable frame {}: {}", path.display(), e),
            }
        }
        Ok(FrameRead::EndOfStream)
    }

    fn is_alive(&self) -> bool {
        !self.stopped && self.cursor < self.paths.len()
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

// ============================================================================
// SYNTHETIC ROAD
// ============================================================================

const ROAD_GREY: Rgb<u8> = Rgb([90, 90, 90]);
const PAINT_WHITE: Rgb<u8> = Rgb([235, 235, 235]);
const VEHICLE_COLORS: &[[u8; 3]] = &[
    [200, 30, 30],
    [30, 60, 210],
    [20, 170, 60],
    [230, 200, 0],
    [0, 170, 200],
    [190, 40, 190],
];
const SYNTHETIC_LANES: u32 = 3;
const VEHICLE_LENGTH: u32 = 56;
const DASH_LENGTH: u32 = 24;

#[derive(Debug, Clone)]
struct Lane {
    /// Pixels per frame along +y
    speed: f32,
    spacing: f32,
    offset: f32,
    colors: Vec<Rgb<u8>>,
}

/// Deterministic top-down road with vehicles driving down each lane.
///
/// Vehicles in a lane share a speed and spacing, so they never touch and
/// each renders as one saturated blob on a grey road.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    lanes: Vec<Lane>,
    next_index: u64,
    max_frames: Option<u64>,
    frame_interval: Option<Duration>,
    last_emit: Option<Instant>,
    stopped: bool,
}

impl SyntheticSource {
    pub fn new(seed: u64, frames: Option<u64>, fps: f32) -> Self {
        Self::with_size(seed, frames, fps, SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT)
    }

    pub fn with_size(seed: u64, frames: Option<u64>, fps: f32, width: u32, height: u32) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let lanes = (0..SYNTHETIC_LANES)
            .map(|_| {
                let count = rng.gen_range(1..=3);
                Lane {
                    speed: rng.gen_range(2.0..9.0),
                    spacing: rng.gen_range(150.0..260.0),
                    offset: rng.gen_range(0.0..150.0),
                    colors: (0..count)
                        .map(|_| Rgb(VEHICLE_COLORS[rng.gen_range(0..VEHICLE_COLORS.len())]))
                        .collect(),
                }
            })
            .collect();

        let frame_interval = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f32(1.0 / fps));

        Self {
            width: width.max(SYNTHETIC_LANES * 8),
            height: height.max(VEHICLE_LENGTH),
            lanes,
            next_index: 0,
            max_frames: frames,
            frame_interval,
            last_emit: None,
            stopped: false,
        }
    }

    fn render(&self, index: u64) -> RgbImage {
        let mut img = RgbImage::from_pixel(self.width, self.height, ROAD_GREY);
        let lane_width = self.width / SYNTHETIC_LANES;

        // Dashed dividers
        for i in 1..SYNTHETIC_LANES {
            let x = (lane_width * i) as i32 - 1;
            let mut y = 0;
            while y < self.height {
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at(x, y as i32).of_size(2, DASH_LENGTH.min(self.height - y)),
                    PAINT_WHITE,
                );
                y += DASH_LENGTH * 2;
            }
        }

        let vehicle_width = (lane_width * 3 / 5).max(4);
        let cycle = self.height as f32 + VEHICLE_LENGTH as f32;
        for (i, lane) in self.lanes.iter().enumerate() {
            let x = (lane_width * i as u32 + (lane_width - vehicle_width) / 2) as i32;
            let travelled = lane.offset + lane.speed * index as f32;
            for (k, color) in lane.colors.iter().enumerate() {
                let pos = (travelled + k as f32 * lane.spacing).rem_euclid(cycle);
                let top = pos as i32 - VEHICLE_LENGTH as i32;
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at(x, top).of_size(vehicle_width, VEHICLE_LENGTH),
                    *color,
                );
            }
        }
        img
    }

    fn pace(&mut self) {
        if let Some(interval) = self.frame_interval {
            if let Some(last) = self.last_emit {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
            self.last_emit = Some(Instant::now());
        }
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<FrameRead, SourceError> {
        if !self.is_alive() {
            return Ok(FrameRead::EndOfStream);
        }
        self.pace();
        let index = self.next_index;
        self.next_index += 1;
        Ok(FrameRead::Frame {
            index,
            image: self.render(index),
        })
    }

    fn is_alive(&self) -> bool {
        !self.stopped && self.max_frames.map_or(true, |max| self.next_index < max)
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
