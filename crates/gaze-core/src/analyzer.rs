//! The face-analysis contract.
//!
//! Detection, landmarking, and embedding extraction are an external
//! capability — typically a separate engine process. This module defines the
//! boundary: a frame goes in, zero or more detections come out, latency is
//! variable and unbounded.

use crate::frame::Frame;
use crate::types::Detection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analysis engine unavailable: {0}")]
    Unavailable(String),
    #[error("analysis failed: {0}")]
    Backend(String),
    #[error("engine returned an unparseable response: {0}")]
    InvalidResponse(String),
}

/// An opaque face-analysis capability.
///
/// One call yields the finite set of faces found in one frame — the sequence
/// is one-shot, not restartable. An empty result means no faces, not an
/// error. Callers must never assume a latency bound.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, frame: &Frame) -> Result<Vec<Detection>, AnalyzerError>;
}

/// Policy for choosing "the" face when an enrollment image contains several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceSelection {
    /// Pick the detection with the largest bounding-box area. On an exact
    /// area tie the first detection in analyzer order wins, so the choice is
    /// deterministic for a given analyzer output.
    #[default]
    LargestBox,
    /// Refuse to pick: more than one face is an error.
    RejectAmbiguous,
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected, refusing to choose")]
    AmbiguousFaces { count: usize },
}

/// Apply a [`FaceSelection`] policy to an analyzer result.
pub fn select_primary(
    detections: &[Detection],
    policy: FaceSelection,
) -> Result<&Detection, SelectionError> {
    match detections {
        [] => Err(SelectionError::NoFaceDetected),
        [only] => Ok(only),
        many => match policy {
            FaceSelection::RejectAmbiguous => Err(SelectionError::AmbiguousFaces {
                count: many.len(),
            }),
            FaceSelection::LargestBox => {
                let mut best = &many[0];
                for det in &many[1..] {
                    // Strict comparison: earlier detections win exact ties.
                    if det.bbox.area() > best.bbox.area() {
                        best = det;
                    }
                }
                Ok(best)
            }
        },
    }
}
