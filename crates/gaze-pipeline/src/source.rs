//! Frame acquisition contract and the image replay source.

use gaze_core::Frame;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const REPLAY_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("capture source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// Outcome of one bounded poll of a frame source.
#[derive(Debug)]
pub enum FramePoll {
    /// A new frame.
    Frame(Frame),
    /// Nothing yet; the caller re-polls. Guarantees the poll returned within
    /// roughly the requested timeout, which is what keeps stop latency
    /// bounded even on a stalled source.
    Pending,
    /// The source has no more frames and never will. Clean end of stream.
    Exhausted,
}

/// An external frame producer.
///
/// `poll_frame` must block for at most `timeout`, returning
/// [`FramePoll::Pending`] if no frame arrived in that window. Errors are
/// terminal for the source.
pub trait FrameSource: Send {
    fn poll_frame(&mut self, timeout: Duration) -> Result<FramePoll, CaptureError>;
}

/// Replays a directory of still images as a frame stream at a fixed
/// interval, optionally looping. Stands in for a live camera in demos and
/// soak tests; frames are decoded lazily, one per tick.
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    interval: Duration,
    loop_playback: bool,
    index: usize,
    next_due: Option<Instant>,
}

impl ImageDirSource {
    pub fn new(dir: &Path, interval: Duration, loop_playback: bool) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension().and_then(|e| e.to_str()).is_some_and(|e| {
                        REPLAY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str())
                    })
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(CaptureError::SourceUnavailable(format!(
                "{}: no image files",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");
        Ok(Self {
            paths,
            interval,
            loop_playback,
            index: 0,
            next_due: None,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn poll_frame(&mut self, timeout: Duration) -> Result<FramePoll, CaptureError> {
        if self.index >= self.paths.len() {
            if !self.loop_playback {
                return Ok(FramePoll::Exhausted);
            }
            self.index = 0;
        }

        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let remaining = due - now;
            if remaining > timeout {
                std::thread::sleep(timeout);
                return Ok(FramePoll::Pending);
            }
            std::thread::sleep(remaining);
        }

        let path = &self.paths[self.index];
        self.index += 1;
        self.next_due = Some(due + self.interval);

        let frame = Frame::load(path)
            .map_err(|e| CaptureError::ReadFailed(e.to_string()))?;
        Ok(FramePoll::Frame(frame))
    }
}
