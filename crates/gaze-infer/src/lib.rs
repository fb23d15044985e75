//! gaze-infer — D-Bus client for the external face engine.
//!
//! Detection and embedding extraction run in a separate engine service that
//! owns the models; this crate is the thin adapter that makes the service
//! look like a [`FaceAnalyzer`]. The process never loads a model itself.

use gaze_core::{AnalyzerError, Detection, FaceAnalyzer, Frame};
use std::time::Duration;

// `#[zbus::proxy]` generates both `FaceEngineProxy` (async) and
// `FaceEngineProxyBlocking`. Only the blocking variant is used here: the
// pipeline already isolates analysis on a blocking thread.
#[zbus::proxy(
    interface = "org.gaze.FaceEngine1",
    default_service = "org.gaze.FaceEngine1",
    default_path = "/org/gaze/FaceEngine1"
)]
trait FaceEngine {
    /// Analyze one grayscale frame; returns a JSON array of detections.
    async fn analyze(&self, width: u32, height: u32, data: &[u8]) -> zbus::Result<String>;
}

/// A [`FaceAnalyzer`] backed by the engine service on the session bus.
pub struct RemoteAnalyzer {
    proxy: FaceEngineProxyBlocking<'static>,
}

impl RemoteAnalyzer {
    /// Connect to the engine service. Every later call is bounded by
    /// `timeout` so a hung engine cannot stall the caller forever.
    pub fn connect(timeout: Duration) -> Result<Self, AnalyzerError> {
        let conn = zbus::blocking::connection::Builder::session()
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?
            .method_timeout(timeout)
            .build()
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?;
        let proxy = FaceEngineProxyBlocking::new(&conn)
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?;
        tracing::info!(?timeout, "connected to face engine");
        Ok(Self { proxy })
    }
}

impl FaceAnalyzer for RemoteAnalyzer {
    fn analyze(&mut self, frame: &Frame) -> Result<Vec<Detection>, AnalyzerError> {
        let response = self
            .proxy
            .analyze(frame.width, frame.height, &frame.data)
            .map_err(|e| AnalyzerError::Backend(e.to_string()))?;
        decode_detections(&response)
    }
}

fn decode_detections(response: &str) -> Result<Vec<Detection>, AnalyzerError> {
    serde_json::from_str(response).map_err(|e| AnalyzerError::InvalidResponse(e.to_string()))
}
