//! Vehicle detector capability and the built-in blob detector.

use crate::types::{BBox, Detection};
use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

/// COCO class for "car"; the blob detector labels everything as a car.
pub const CLASS_CAR: u32 = 2;

/// Errors a detector may report. Callers treat any of them as "no detections".
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectorError {
    #[error("Model not loaded: {0}")]
    ModelUnavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Frame rejected: {0}")]
    InvalidFrame(String),
}

/// Produces detections for one frame.
pub trait Detector: Send {
    /// Runs detection. Results below `confidence_threshold` or outside
    /// `class_filter` (when non-empty) must not be returned.
    fn predict(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Saturation-threshold blob detector.
///
/// Road surface and lane paint are near-grey; painted vehicle bodies are
/// saturated. Pixels whose channel spread exceeds `saturation_threshold`
/// are foreground, and each 8-connected foreground region becomes one
/// detection whose confidence is its fill ratio within its bounding box.
#[derive(Debug, Clone)]
pub struct BlobDetector {
    /// Minimum max-min channel spread for a foreground pixel
    pub saturation_threshold: u8,

    /// Regions smaller than this many pixels are ignored
    pub min_pixels: u32,
}

impl Default for BlobDetector {
    fn default() -> Self {
        Self {
            saturation_threshold: 60,
            min_pixels: 30,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixels: u32,
}

impl BlobDetector {
    fn foreground_mask(&self, frame: &RgbImage) -> GrayImage {
        let threshold = self.saturation_threshold;
        GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
            let p = frame.get_pixel(x, y).0;
            let max = p[0].max(p[1]).max(p[2]);
            let min = p[0].min(p[1]).min(p[2]);
            if max - min > threshold {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        })
    }
}

impl Detector for BlobDetector {
    fn predict(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<Detection>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectorError::InvalidFrame("zero-sized frame".to_string()));
        }
        if !class_filter.is_empty() && !class_filter.contains(&CLASS_CAR) {
            return Ok(Vec::new());
        }

        let mask = self.foreground_mask(frame);
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut regions: HashMap<u32, Region> = HashMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label.0[0];
            if label == 0 {
                continue;
            }
            regions
                .entry(label)
                .and_modify(|r| {
                    r.min_x = r.min_x.min(x);
                    r.min_y = r.min_y.min(y);
                    r.max_x = r.max_x.max(x);
                    r.max_y = r.max_y.max(y);
                    r.pixels += 1;
                })
                .or_insert(Region {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    pixels: 1,
                });
        }

        let mut labels_sorted: Vec<u32> = regions.keys().copied().collect();
        labels_sorted.sort_unstable();

        let detections = labels_sorted
            .into_iter()
            .filter_map(|label| {
                let r = regions[&label];
                if r.pixels < self.min_pixels {
                    return None;
                }
                let width = (r.max_x - r.min_x + 1) as f64;
                let height = (r.max_y - r.min_y + 1) as f64;
                let confidence = (r.pixels as f64 / (width * height)).clamp(0.0, 1.0) as f32;
                if confidence < confidence_threshold {
                    return None;
                }
                let bbox = BBox::new(r.min_x as f64, r.min_y as f64, width, height);
                Some(Detection::from_bbox(bbox, confidence, CLASS_CAR))
            })
            .collect();

        Ok(detections)
    }
}
