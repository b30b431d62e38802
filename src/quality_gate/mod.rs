//! QualityGate - Local Frame Pre-filter
//!
//! Rejects samples not worth an inference call: black frames during camera
//! warm-up, glare, and truncated or tiny payloads. Never touches the network.

use crate::frame_sampler::FrameSample;
use image::imageops::FilterType;
use serde::Serialize;

pub const DEFAULT_DARK_THRESHOLD: f32 = 40.0;
pub const DEFAULT_BRIGHT_THRESHOLD: f32 = 220.0;
/// Edge of the coarse grid the mean luma is computed over
pub const DEFAULT_LUMA_GRID: u32 = 50;
pub const DEFAULT_MIN_EDGE_PX: u32 = 64;
pub const DEFAULT_MIN_BYTES: usize = 256;

/// Why a sample was or was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum QualityVerdict {
    Pass { mean_luma: f32 },
    TooDark { mean_luma: f32 },
    TooBright { mean_luma: f32 },
    TooSmall { width: u32, height: u32, bytes: usize },
    Undecodable,
}

impl QualityVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, QualityVerdict::Pass { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityVerdict::Pass { .. } => "pass",
            QualityVerdict::TooDark { .. } => "too_dark",
            QualityVerdict::TooBright { .. } => "too_bright",
            QualityVerdict::TooSmall { .. } => "too_small",
            QualityVerdict::Undecodable => "undecodable",
        }
    }
}

/// Gate thresholds
#[derive(Debug, Clone)]
pub struct QualityGate {
    pub dark_threshold: f32,
    pub bright_threshold: f32,
    pub luma_grid: u32,
    pub min_edge_px: u32,
    pub min_bytes: usize,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            dark_threshold: DEFAULT_DARK_THRESHOLD,
            bright_threshold: DEFAULT_BRIGHT_THRESHOLD,
            luma_grid: DEFAULT_LUMA_GRID,
            min_edge_px: DEFAULT_MIN_EDGE_PX,
            min_bytes: DEFAULT_MIN_BYTES,
        }
    }
}

impl QualityGate {
    pub fn with_thresholds(dark_threshold: f32, bright_threshold: f32) -> Self {
        Self {
            dark_threshold,
            bright_threshold,
            ..Self::default()
        }
    }

    /// Shorthand for `evaluate(sample).passed()`
    pub fn passes_quality(&self, sample: &FrameSample) -> bool {
        self.evaluate(sample).passed()
    }

    pub fn evaluate(&self, sample: &FrameSample) -> QualityVerdict {
        if sample.width < self.min_edge_px
            || sample.height < self.min_edge_px
            || sample.bytes.len() < self.min_bytes
        {
            return QualityVerdict::TooSmall {
                width: sample.width,
                height: sample.height,
                bytes: sample.bytes.len(),
            };
        }

        let mean_luma = match self.mean_luma(&sample.bytes) {
            Some(luma) => luma,
            None => return QualityVerdict::Undecodable,
        };

        if mean_luma < self.dark_threshold {
            QualityVerdict::TooDark { mean_luma }
        } else if mean_luma > self.bright_threshold {
            QualityVerdict::TooBright { mean_luma }
        } else {
            QualityVerdict::Pass { mean_luma }
        }
    }

    /// Rec. 601 mean luma on a 0-255 scale over the coarse grid
    fn mean_luma(&self, encoded: &[u8]) -> Option<f32> {
        let decoded = image::load_from_memory(encoded).ok()?;
        let grid = self.luma_grid.max(1);
        let coarse = decoded.resize_exact(grid, grid, FilterType::Nearest).to_rgb8();

        let pixel_count = coarse.pixels().len();
        if pixel_count == 0 {
            return None;
        }

        let total: f64 = coarse
            .pixels()
            .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
            .sum();

        Some((total / pixel_count as f64) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_sampler::FrameSampler;
    use image::{DynamicImage, ImageBuffer, Rgb};

    fn uniform_sample(value: u8) -> FrameSample {
        let frame = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            640,
            480,
            Rgb([value, value, value]),
        ));
        FrameSampler::default().encode(&frame).unwrap()
    }

    #[test]
    fn test_dark_frame_rejected() {
        let verdict = QualityGate::default().evaluate(&uniform_sample(5));
        assert!(matches!(verdict, QualityVerdict::TooDark { .. }));
        assert!(!verdict.passed());
    }

    #[test]
    fn test_bright_frame_rejected() {
        let verdict = QualityGate::default().evaluate(&uniform_sample(250));
        assert!(matches!(verdict, QualityVerdict::TooBright { .. }));
    }

    #[test]
    fn test_mid_gray_passes() {
        let verdict = QualityGate::default().evaluate(&uniform_sample(128));
        match verdict {
            QualityVerdict::Pass { mean_luma } => assert!((mean_luma - 128.0).abs() < 4.0),
            other => panic!("expected pass, got {:?}", other),
        }
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let gate = QualityGate::with_thresholds(10.0, 245.0);
        assert!(gate.passes_quality(&uniform_sample(30)));
        assert!(!QualityGate::default().passes_quality(&uniform_sample(30)));
    }

    #[test]
    fn test_tiny_sample_rejected() {
        let mut sample = uniform_sample(128);
        sample.width = 16;
        sample.height = 16;
        assert!(matches!(
            QualityGate::default().evaluate(&sample),
            QualityVerdict::TooSmall { .. }
        ));
    }

    #[test]
    fn test_garbage_bytes_undecodable() {
        let sample = FrameSample {
            bytes: vec![0xAB; 4096],
            width: 320,
            height: 320,
            captured_at: chrono::Utc::now(),
        };
        assert_eq!(QualityGate::default().evaluate(&sample), QualityVerdict::Undecodable);
    }
}
