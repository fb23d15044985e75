//! Two-stage capture/inference pipeline.
//!
//! Capture runs on a dedicated OS thread polling the frame source; inference
//! runs as a tokio task. The stages are joined by a single-slot watch
//! channel, so a new frame overwrites an unconsumed one and inference always
//! works on the freshest capture. Overwritten frames are counted as dropped,
//! never queued.

use crate::shared::StoreHandle;
use crate::source::{CaptureError, FramePoll, FrameSource};
use gaze_core::{CosineMatcher, FaceAnalyzer, Frame, MatchResult, Matcher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("pipeline did not drain within {0:?}")]
    DrainTimeout(Duration),
}

/// What to do with an analysis already in flight when the pipeline stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Let the in-flight analysis finish and publish its result.
    #[default]
    FinishInFlight,
    /// Abandon the in-flight analysis; its result is never published.
    DiscardInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on a single source poll; bounds stop latency.
    pub poll_timeout: Duration,
    pub drain_policy: DrainPolicy,
    /// How long `stop` waits for each stage before giving up.
    pub drain_timeout: Duration,
    /// Initial similarity threshold; adjustable at runtime.
    pub similarity_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(250),
            drain_policy: DrainPolicy::FinishInFlight,
            drain_timeout: Duration::from_secs(2),
            similarity_threshold: 0.40,
        }
    }
}

/// One processed frame: every detected face identified against the store.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub sequence: u64,
    pub captured_at: Instant,
    /// Capture-to-publish latency.
    pub latency: Duration,
    pub matches: Vec<MatchResult>,
}

#[derive(Default)]
struct StatsInner {
    captured: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time throughput counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub captured: u64,
    pub processed: u64,
    /// Frames overwritten in the hand-off slot before inference took them.
    pub dropped: u64,
}

/// A configured pipeline, not yet running.
pub struct CapturePipeline {
    config: PipelineConfig,
    state: Arc<watch::Sender<PipelineState>>,
}

impl CapturePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Spawn both stages and hand back the running pipeline's handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        self,
        source: Box<dyn FrameSource>,
        analyzer: Arc<Mutex<dyn FaceAnalyzer>>,
        store: StoreHandle,
    ) -> PipelineHandle {
        let (frame_tx, frame_rx) = watch::channel(None::<Frame>);
        let (result_tx, result_rx) = watch::channel(None::<PipelineResult>);
        let (threshold_tx, threshold_rx) = watch::channel(self.config.similarity_threshold);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let error = Arc::new(Mutex::new(None::<CaptureError>));
        let stats = Arc::new(StatsInner::default());

        self.state.send_replace(PipelineState::Running);

        let capture = {
            let stop_flag = Arc::clone(&stop_flag);
            let error = Arc::clone(&error);
            let stats = Arc::clone(&stats);
            let poll_timeout = self.config.poll_timeout;
            let mut source = source;
            std::thread::Builder::new()
                .name("gaze-capture".into())
                .spawn(move || {
                    let mut sequence: u64 = 0;
                    loop {
                        if stop_flag.load(Ordering::Relaxed) {
                            break;
                        }
                        match source.poll_frame(poll_timeout) {
                            Ok(FramePoll::Pending) => continue,
                            Ok(FramePoll::Exhausted) => {
                                tracing::info!(captured = sequence, "frame source exhausted");
                                break;
                            }
                            Ok(FramePoll::Frame(mut frame)) => {
                                sequence += 1;
                                frame.sequence = sequence;
                                stats.captured.fetch_add(1, Ordering::Relaxed);
                                // send_replace overwrites any unconsumed frame
                                if frame_tx.send(Some(frame)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "capture failed");
                                *error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                                break;
                            }
                        }
                    }
                    // frame_tx drops here, closing the slot so inference
                    // notices the end of the stream.
                })
                .expect("failed to spawn capture thread")
        };

        let inference = {
            let state = Arc::clone(&self.state);
            let stats = Arc::clone(&stats);
            let drain_policy = self.config.drain_policy;
            let mut frame_rx = frame_rx.clone();
            let mut stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                let matcher = CosineMatcher;
                let mut last_seen: u64 = 0;
                let mut source_ended = false;
                loop {
                    if *stop_rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        changed = frame_rx.changed() => {
                            if changed.is_err() {
                                source_ended = true;
                                break;
                            }
                        }
                        _ = stop_rx.changed() => continue,
                    }
                    let Some(frame) = frame_rx.borrow_and_update().clone() else {
                        continue;
                    };

                    if frame.sequence > last_seen + 1 {
                        stats
                            .dropped
                            .fetch_add(frame.sequence - last_seen - 1, Ordering::Relaxed);
                    }
                    last_seen = frame.sequence;

                    let work = {
                        let analyzer = Arc::clone(&analyzer);
                        let frame = frame.clone();
                        tokio::task::spawn_blocking(move || {
                            let mut guard =
                                analyzer.lock().unwrap_or_else(PoisonError::into_inner);
                            guard.analyze(&frame)
                        })
                    };
                    let joined = match drain_policy {
                        DrainPolicy::FinishInFlight => work.await,
                        DrainPolicy::DiscardInFlight => tokio::select! {
                            joined = work => joined,
                            _ = stop_rx.changed() => break,
                        },
                    };

                    match joined {
                        Ok(Ok(detections)) => {
                            let snapshot = store.snapshot();
                            let threshold = *threshold_rx.borrow();
                            let matches: Vec<MatchResult> = detections
                                .iter()
                                .map(|d| matcher.identify(d, &snapshot, threshold))
                                .collect();
                            stats.processed.fetch_add(1, Ordering::Relaxed);
                            let _ = result_tx.send(Some(PipelineResult {
                                sequence: frame.sequence,
                                captured_at: frame.captured_at,
                                latency: frame.captured_at.elapsed(),
                                matches,
                            }));
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(
                                sequence = frame.sequence,
                                error = %e,
                                "analysis failed, frame skipped"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "analysis task failed to join");
                        }
                    }
                }
                if source_ended {
                    // The source finished or failed on its own; nobody will
                    // call stop, so finalize the state here.
                    state.send_replace(PipelineState::Stopped);
                }
            })
        };

        PipelineHandle {
            config: self.config,
            state: self.state,
            stop_flag,
            stop_tx,
            threshold_tx,
            frame_rx,
            result_rx,
            error,
            stats,
            capture: Some(capture),
            inference: Some(inference),
        }
    }
}

/// Handle to a running pipeline. Dropping it requests a stop without
/// waiting; call [`PipelineHandle::stop`] for an orderly drain.
pub struct PipelineHandle {
    config: PipelineConfig,
    state: Arc<watch::Sender<PipelineState>>,
    stop_flag: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    threshold_tx: watch::Sender<f32>,
    frame_rx: watch::Receiver<Option<Frame>>,
    result_rx: watch::Receiver<Option<PipelineResult>>,
    error: Arc<Mutex<Option<CaptureError>>>,
    stats: Arc<StatsInner>,
    capture: Option<std::thread::JoinHandle<()>>,
    inference: Option<tokio::task::JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// The most recent captured frame, if any. Reads the cache; does not
    /// consume anything.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.frame_rx.borrow().clone()
    }

    /// The most recent identification result, if any.
    pub fn latest_result(&self) -> Option<PipelineResult> {
        self.result_rx.borrow().clone()
    }

    pub fn subscribe_results(&self) -> watch::Receiver<Option<PipelineResult>> {
        self.result_rx.clone()
    }

    /// Adjust the match threshold; applies from the next processed frame.
    pub fn set_threshold(&self, threshold: f32) {
        let _ = self.threshold_tx.send(threshold);
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            captured: self.stats.captured.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Publish a state change. `Stopped` is terminal: once there, later
    /// writes (a stop call racing the pipeline's own shutdown) are ignored.
    fn publish_state(&self, next: PipelineState) {
        self.state.send_if_modified(|state| {
            if *state == PipelineState::Stopped || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// The capture failure that terminated the stream, if one did.
    pub fn error(&self) -> Option<CaptureError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop both stages and wait for them to drain.
    ///
    /// Capture always finishes its current poll; the in-flight analysis is
    /// finished or abandoned per [`DrainPolicy`]. Returns the capture error
    /// if the stream had already failed.
    pub async fn stop(mut self) -> Result<(), PipelineError> {
        self.publish_state(PipelineState::Draining);
        self.stop_flag.store(true, Ordering::Relaxed);
        let _ = self.stop_tx.send(true);

        if let Some(capture) = self.capture.take() {
            let join = tokio::task::spawn_blocking(move || capture.join());
            match tokio::time::timeout(self.config.drain_timeout, join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(_))) => tracing::error!("capture thread panicked"),
                Ok(Err(e)) => tracing::error!(error = %e, "capture join failed"),
                Err(_) => {
                    self.publish_state(PipelineState::Stopped);
                    return Err(PipelineError::DrainTimeout(self.config.drain_timeout));
                }
            }
        }

        if let Some(mut inference) = self.inference.take() {
            match tokio::time::timeout(self.config.drain_timeout, &mut inference).await {
                Ok(_) => {}
                Err(_) => {
                    inference.abort();
                    self.publish_state(PipelineState::Stopped);
                    return Err(PipelineError::DrainTimeout(self.config.drain_timeout));
                }
            }
        }

        self.publish_state(PipelineState::Stopped);
        let error = self
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match error {
            Some(e) => Err(PipelineError::Capture(e)),
            None => Ok(()),
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let _ = self.stop_tx.send(true);
        if let Some(inference) = self.inference.take() {
            inference.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaze_core::{AnalyzerError, BoundingBox, Detection, Embedding, EmbeddingStore};

    fn small_frame() -> Frame {
        Frame::from_gray(vec![128u8; 4], 2, 2).unwrap()
    }

    fn det(values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 20.0,
                height: 20.0,
            },
            embedding: Embedding::new(values),
            quality: 0.9,
            age: None,
            gender: None,
        }
    }

    /// Emits frames back to back, then reports exhaustion.
    struct SyntheticSource {
        remaining: usize,
        pace: Duration,
    }

    impl SyntheticSource {
        fn new(frames: usize, pace: Duration) -> Self {
            Self {
                remaining: frames,
                pace,
            }
        }
    }

    impl FrameSource for SyntheticSource {
        fn poll_frame(&mut self, _timeout: Duration) -> Result<FramePoll, CaptureError> {
            if self.remaining == 0 {
                return Ok(FramePoll::Exhausted);
            }
            self.remaining -= 1;
            std::thread::sleep(self.pace);
            Ok(FramePoll::Frame(small_frame()))
        }
    }

    /// Fails partway through the stream.
    struct FailingSource {
        frames_before_failure: usize,
    }

    impl FrameSource for FailingSource {
        fn poll_frame(&mut self, _timeout: Duration) -> Result<FramePoll, CaptureError> {
            if self.frames_before_failure == 0 {
                return Err(CaptureError::ReadFailed("sensor gone".into()));
            }
            self.frames_before_failure -= 1;
            Ok(FramePoll::Frame(small_frame()))
        }
    }

    /// Takes a fixed amount of time per frame and always sees one face.
    struct SlowAnalyzer {
        delay: Duration,
        embedding: Vec<f32>,
    }

    impl FaceAnalyzer for SlowAnalyzer {
        fn analyze(&mut self, _frame: &Frame) -> Result<Vec<Detection>, AnalyzerError> {
            std::thread::sleep(self.delay);
            Ok(vec![det(self.embedding.clone())])
        }
    }

    fn slow_analyzer(delay_ms: u64) -> Arc<Mutex<dyn FaceAnalyzer>> {
        Arc::new(Mutex::new(SlowAnalyzer {
            delay: Duration::from_millis(delay_ms),
            embedding: vec![1.0, 0.0],
        }))
    }

    fn store_with_alice() -> StoreHandle {
        let mut store = EmbeddingStore::new(2);
        store
            .add("Alice", Embedding::new(vec![1.0, 0.0]), "test", None)
            .unwrap();
        StoreHandle::new(store)
    }

    async fn wait_for_stopped(handle: &PipelineHandle) {
        let mut state_rx = handle.subscribe_state();
        while *state_rx.borrow_and_update() != PipelineState::Stopped {
            state_rx.changed().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_inference_drops_frames_not_memory() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(60, Duration::from_millis(1))),
            slow_analyzer(20),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        wait_for_stopped(&handle).await;

        let stats = handle.stats();
        assert_eq!(stats.captured, 60);
        assert!(stats.processed < stats.captured);
        assert!(stats.dropped >= 1);
        // Accounting is exact: every captured frame was either processed,
        // dropped in the hand-off slot, or at most one was left unconsumed.
        assert!(stats.processed + stats.dropped <= stats.captured);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_results_have_monotonic_sequences() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(30, Duration::from_millis(1))),
            slow_analyzer(5),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        let mut results = handle.subscribe_results();
        let mut sequences = Vec::new();
        while results.changed().await.is_ok() {
            if let Some(r) = results.borrow_and_update().clone() {
                sequences.push(r.sequence);
            }
        }

        assert!(!sequences.is_empty());
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_latest_result_is_cached_for_late_readers() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(3, Duration::from_millis(1))),
            slow_analyzer(1),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        wait_for_stopped(&handle).await;

        // All frames were processed long ago; the cache still serves the
        // last result to a reader arriving now.
        let result = handle.latest_result().expect("a result should be cached");
        assert_eq!(result.matches.len(), 1);
        assert!(handle.latest_frame().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_matches_identify_against_store() {
        let pipeline = CapturePipeline::new(PipelineConfig {
            similarity_threshold: 0.5,
            ..PipelineConfig::default()
        });
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(3, Duration::from_millis(1))),
            slow_analyzer(1),
            store_with_alice(),
        );

        wait_for_stopped(&handle).await;

        let result = handle.latest_result().unwrap();
        assert_eq!(result.matches[0].identity.as_deref(), Some("Alice"));
        assert!(result.matches[0].similarity > 0.99);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_is_bounded_and_orderly() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let handle = pipeline.start(
            // Endless stream; only stop() ends it.
            Box::new(SyntheticSource::new(usize::MAX, Duration::from_millis(1))),
            slow_analyzer(10),
            StoreHandle::new(EmbeddingStore::new(2)),
        );
        assert_eq!(handle.state(), PipelineState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let state_rx = handle.subscribe_state();
        let started = Instant::now();
        handle.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(*state_rx.borrow(), PipelineState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discard_policy_stops_without_waiting_for_inference() {
        let pipeline = CapturePipeline::new(PipelineConfig {
            drain_policy: DrainPolicy::DiscardInFlight,
            drain_timeout: Duration::from_secs(5),
            ..PipelineConfig::default()
        });
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(usize::MAX, Duration::from_millis(1))),
            slow_analyzer(500),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        let started = Instant::now();
        handle.stop().await.unwrap();
        // Did not wait out the 500ms analysis.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_failure_is_terminal_and_reported() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        let handle = pipeline.start(
            Box::new(FailingSource {
                frames_before_failure: 2,
            }),
            slow_analyzer(1),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        wait_for_stopped(&handle).await;

        assert!(matches!(handle.error(), Some(CaptureError::ReadFailed(_))));
        let result = handle.stop().await;
        assert!(matches!(
            result,
            Err(PipelineError::Capture(CaptureError::ReadFailed(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_source_exhaustion_stops_cleanly() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(5, Duration::from_millis(1))),
            slow_analyzer(1),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        wait_for_stopped(&handle).await;

        assert!(handle.error().is_none());
        assert_eq!(handle.stats().captured, 5);
        handle.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_after_self_termination_keeps_state_terminal() {
        let pipeline = CapturePipeline::new(PipelineConfig::default());
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(2, Duration::from_millis(1))),
            slow_analyzer(1),
            StoreHandle::new(EmbeddingStore::new(2)),
        );

        wait_for_stopped(&handle).await;

        // The pipeline already reached its terminal state on its own; a
        // late stop call must not re-announce Draining over it.
        let mut state_rx = handle.subscribe_state();
        handle.stop().await.unwrap();

        let mut republished = Vec::new();
        while state_rx.changed().await.is_ok() {
            republished.push(*state_rx.borrow_and_update());
        }
        assert!(republished.is_empty(), "got {republished:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threshold_update_applies_to_later_frames() {
        let pipeline = CapturePipeline::new(PipelineConfig {
            // Impossibly high: everything is Unknown at first.
            similarity_threshold: 1.1,
            ..PipelineConfig::default()
        });
        let handle = pipeline.start(
            Box::new(SyntheticSource::new(usize::MAX, Duration::from_millis(1))),
            slow_analyzer(5),
            store_with_alice(),
        );

        let mut results = handle.subscribe_results();
        results.changed().await.unwrap();
        let first = results.borrow_and_update().clone().unwrap();
        assert!(first.matches[0].identity.is_none());

        handle.set_threshold(0.5);
        // Skip a few frames to be past anything analyzed pre-update.
        for _ in 0..5 {
            results.changed().await.unwrap();
        }
        let later = results.borrow_and_update().clone().unwrap();
        assert_eq!(later.matches[0].identity.as_deref(), Some("Alice"));

        handle.stop().await.unwrap();
    }
}
