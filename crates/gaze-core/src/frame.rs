//! Grayscale frame type shared by enrollment and the capture pipeline.

use std::path::Path;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to read image {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: u64, actual: u64 },
}

/// A captured grayscale frame.
///
/// `sequence` is assigned by the capture pipeline and increases monotonically
/// per pipeline instance; frames loaded outside a pipeline carry sequence 0.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    /// Wrap an existing grayscale buffer. Fails if the buffer is shorter
    /// than `width * height`.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        // Widen before multiplying: width * height can exceed u32.
        let expected = u64::from(width) * u64::from(height);
        if (data.len() as u64) < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len() as u64,
            });
        }
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
            captured_at: Instant::now(),
        })
    }

    /// Decode an image file into a grayscale frame.
    pub fn load(path: &Path) -> Result<Self, FrameError> {
        let img = image::open(path).map_err(|e| FrameError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let gray = img.to_luma8();
        let (width, height) = (gray.width(), gray.height());
        Self::from_gray(gray.into_raw(), width, height)
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_gray_valid() {
        let frame = Frame::from_gray(vec![128u8; 64], 8, 8).unwrap();
        assert_eq!(frame.width, 8);
        assert_eq!(frame.sequence, 0);
    }

    #[test]
    fn test_from_gray_too_short() {
        let result = Frame::from_gray(vec![0u8; 10], 8, 8);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 64, actual: 10 })
        ));
    }

    #[test]
    fn test_from_gray_huge_dimensions_do_not_wrap() {
        // 65536 * 65536 is exactly 2^32: a u32 product wraps to zero and
        // would accept an empty buffer.
        let result = Frame::from_gray(Vec::new(), 65_536, 65_536);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 4_294_967_296, actual: 0 })
        ));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::from_gray(vec![100u8; 16], 4, 4).unwrap();
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Frame::load(Path::new("/nonexistent/face.png"));
        assert!(matches!(result, Err(FrameError::Decode { .. })));
    }
}
