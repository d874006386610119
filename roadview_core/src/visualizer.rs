//! Frame annotation: lane dividers, track boxes colored by behavior, and a
//! small congestion strip along the top edge.

use crate::metrics::{CongestionLevel, FeedMetrics};
use crate::types::{Behavior, TrackMap};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisualizerError {
    #[error("Cannot annotate an empty frame")]
    EmptyFrame,

    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Draws tracking results onto a frame.
///
/// Implementations return a new image; the caller keeps the original so it
/// can fall back to it on failure.
pub trait Visualizer: Send {
    fn annotate(
        &mut self,
        frame: &RgbImage,
        tracks: &TrackMap,
        metrics: &FeedMetrics,
    ) -> Result<RgbImage, VisualizerError>;
}

/// Default overlay renderer.
#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    pub num_lanes: u32,
    pub box_thickness: u32,
}

impl OverlayRenderer {
    pub fn new(num_lanes: u32) -> Self {
        Self {
            num_lanes: num_lanes.max(1),
            box_thickness: 2,
        }
    }
}

/// Color used for a track box.
pub fn behavior_color(behavior: Behavior) -> Rgb<u8> {
    match behavior {
        Behavior::Stopped => Rgb([220, 40, 40]),
        Behavior::Speeding => Rgb([255, 140, 0]),
        Behavior::Accelerating | Behavior::Decelerating => Rgb([240, 220, 40]),
        Behavior::LaneChanging => Rgb([200, 80, 220]),
        Behavior::Moving => Rgb([40, 200, 80]),
        Behavior::Unknown => Rgb([160, 160, 160]),
    }
}

fn congestion_color(level: CongestionLevel) -> Rgb<u8> {
    match level {
        CongestionLevel::Free => Rgb([40, 200, 80]),
        CongestionLevel::Moderate => Rgb([240, 220, 40]),
        CongestionLevel::Heavy => Rgb([255, 140, 0]),
        CongestionLevel::Jammed => Rgb([220, 40, 40]),
    }
}

impl Visualizer for OverlayRenderer {
    fn annotate(
        &mut self,
        frame: &RgbImage,
        tracks: &TrackMap,
        metrics: &FeedMetrics,
    ) -> Result<RgbImage, VisualizerError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(VisualizerError::EmptyFrame);
        }
        let mut canvas = frame.clone();

        let lane_width = width as f32 / self.num_lanes as f32;
        for i in 1..self.num_lanes {
            let x = lane_width * i as f32;
            draw_line_segment_mut(
                &mut canvas,
                (x, 0.0),
                (x, height as f32 - 1.0),
                Rgb([255, 255, 255]),
            );
        }

        for track in tracks.values() {
            let color = behavior_color(track.behavior);
            let b = &track.bbox;
            for t in 0..self.box_thickness {
                let w = (b.width.round() as i64 - 2 * t as i64).max(1) as u32;
                let h = (b.height.round() as i64 - 2 * t as i64).max(1) as u32;
                let rect = Rect::at(b.x.round() as i32 + t as i32, b.y.round() as i32 + t as i32)
                    .of_size(w, h);
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }

        let strip_h = (height / 40).max(2);
        draw_filled_rect_mut(
            &mut canvas,
            Rect::at(0, 0).of_size(width, strip_h),
            congestion_color(metrics.congestion),
        );

        Ok(canvas)
    }
}

/// Encodes a frame as JPEG bytes.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, VisualizerError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(VisualizerError::EmptyFrame);
    }
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    frame
        .write_with_encoder(encoder)
        .map_err(|e| VisualizerError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, TrackSnapshot};

    fn track(behavior: Behavior) -> TrackSnapshot {
        TrackSnapshot {
            id: "cam-1".to_string(),
            bbox: BBox::new(10.0, 20.0, 30.0, 20.0),
            center: [25.0, 30.0],
            velocity: [0.0, 0.0],
            lane: Some(1),
            speed_kmh: 0.0,
            behavior,
            license_plate: "unknown".to_string(),
            class_id: 2,
            age_secs: 0.5,
        }
    }

    #[test]
    fn test_annotate_draws_box_in_behavior_color() {
        let frame = RgbImage::new(120, 90);
        let tracks: TrackMap = [("cam-1".to_string(), track(Behavior::Stopped))].into();
        let mut renderer = OverlayRenderer::new(3);

        let out = renderer
            .annotate(&frame, &tracks, &FeedMetrics::default())
            .unwrap();

        assert_eq!(out.dimensions(), frame.dimensions());
        assert_eq!(*out.get_pixel(10, 30), behavior_color(Behavior::Stopped));
        // Lane divider at x = 40
        assert_eq!(*out.get_pixel(40, 60), Rgb([255, 255, 255]));
        // Input untouched
        assert_eq!(*frame.get_pixel(10, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_empty_frame_fails() {
        let mut renderer = OverlayRenderer::new(3);
        let result = renderer.annotate(&RgbImage::new(0, 0), &TrackMap::new(), &FeedMetrics::default());
        assert!(matches!(result, Err(VisualizerError::EmptyFrame)));
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg_magic() {
        let bytes = encode_jpeg(&RgbImage::new(16, 16), 75).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
