//! FrameSampler - Still Frame Capture
//!
//! ## Responsibilities
//!
//! - Grab the current frame from the attached stream
//! - Scale it onto a fixed small square raster
//! - Encode as low-quality JPEG for cheap upload

use crate::camera_device::VideoSink;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Sample raster edge in pixels (square)
pub const DEFAULT_SAMPLE_EDGE_PX: u32 = 320;

/// JPEG quality; low is fine for detection and saves bandwidth
pub const DEFAULT_JPEG_QUALITY: u8 = 60;

/// One encoded still frame
#[derive(Debug, Clone)]
pub struct FrameSample {
    /// JPEG bytes
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// Captures frames from a VideoSink
#[derive(Debug, Clone)]
pub struct FrameSampler {
    edge_px: u32,
    jpeg_quality: u8,
}

impl FrameSampler {
    pub fn new(edge_px: u32, jpeg_quality: u8) -> Self {
        Self {
            edge_px: edge_px.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn edge_px(&self) -> u32 {
        self.edge_px
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Capture the current frame of the attached stream
    pub async fn capture(&self, sink: &VideoSink) -> Result<FrameSample> {
        let stream = sink
            .current()
            .ok_or_else(|| Error::Capture("no stream attached".to_string()))?;

        let frame = stream.current_frame().await?;
        self.encode(&frame)
    }

    /// Scale and encode an already decoded frame
    pub fn encode(&self, frame: &DynamicImage) -> Result<FrameSample> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(Error::Capture("empty frame".to_string()));
        }

        let scaled = frame
            .resize_exact(self.edge_px, self.edge_px, FilterType::Triangle)
            .to_rgb8();

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality).encode_image(&scaled)?;

        Ok(FrameSample {
            bytes,
            width: scaled.width(),
            height: scaled.height(),
            captured_at: Utc::now(),
        })
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_EDGE_PX, DEFAULT_JPEG_QUALITY)
    }
}
