//! License-plate OCR capability (best effort).

use image::RgbImage;

/// Errors an OCR backend may report. The tracking engine logs and absorbs them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OcrError {
    #[error("OCR backend failed: {0}")]
    Backend(String),
}

/// Reads a license plate from a vehicle crop.
pub trait PlateReader: Send {
    /// `Ok(None)` means the plate could not be resolved from this crop.
    fn read_plate(&mut self, roi: &RgbImage) -> Result<Option<String>, OcrError>;
}

/// Reader used when no OCR backend is configured; never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlateReader;

impl PlateReader for NoPlateReader {
    fn read_plate(&mut self, _roi: &RgbImage) -> Result<Option<String>, OcrError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_reader_is_unresolved() {
        let mut reader = NoPlateReader;
        let roi = RgbImage::new(10, 10);
        assert!(matches!(reader.read_plate(&roi), Ok(None)));
    }
}
