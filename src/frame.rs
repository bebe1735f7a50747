//! Decoded raster frames.
//!
//! - `Frame`: owned RGB8 raster. Not `Clone`; a frame moves from the source to
//!   the sampler, into the inference queue, and out again inside a
//!   `DetectionResult`. Whoever holds it owns the only copy.
//! - Stages that need a second raster (the annotator draws on a copy and keeps
//!   the original for the side-by-side view) make that copy explicitly.

use image::{imageops, RgbImage};

use crate::error::PipelineError;

/// Bytes per pixel of every frame in the pipeline.
pub const CHANNELS: usize = 3;

/// Owned RGB8 frame.
pub struct Frame {
    /// Private pixel data, row-major RGB8.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Zero-based decode position within the source stream.
    pub index: u64,
}

impl Frame {
    /// Wrap an RGB8 buffer. Fails when the buffer does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self, PipelineError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| PipelineError::DecodeError("frame dimensions overflow".to_string()))?;
        if width == 0 || height == 0 {
            return Err(PipelineError::DecodeError(format!(
                "frame has empty dimensions {}x{}",
                width, height
            )));
        }
        if data.len() != expected {
            return Err(PipelineError::DecodeError(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
        })
    }

    pub fn from_image(image: RgbImage, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
        }
    }

    /// Read-only pixel access for detectors.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Resample to the given size (bilinear). Returns `self` untouched when the
    /// size already matches.
    pub fn resized(self, width: u32, height: u32) -> Self {
        if self.width == width && self.height == height {
            return self;
        }
        let index = self.index;
        let source = self.into_rgb_image();
        let scaled = imageops::resize(&source, width, height, imageops::FilterType::Triangle);
        Self::from_image(scaled, index)
    }

    /// Explicit copy of the raster as an `RgbImage`.
    pub fn to_rgb_image(&self) -> RgbImage {
        // from_rgb/from_image guarantee the length matches the dimensions.
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    pub fn into_rgb_image(self) -> RgbImage {
        let (width, height) = (self.width, self.height);
        RgbImage::from_raw(width, height, self.data).unwrap_or_else(|| RgbImage::new(width, height))
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
