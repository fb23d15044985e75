//! Interactive session loop: renders live results and services commands.

use crate::pipeline::{PipelineError, PipelineHandle, PipelineResult, PipelineState};
use crate::shared::StoreHandle;
use gaze_core::enroll::{enroll_frame, EnrollError};
use gaze_core::{FaceAnalyzer, FaceSelection};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Commands a frontend can issue while the pipeline runs.
#[derive(Debug)]
pub enum SessionCommand {
    /// Enroll the face in the most recent frame under this identity.
    Enroll { identity: String },
    SetThreshold(f32),
    Quit,
}

/// Where session output goes. The CLI renders to the terminal; tests
/// collect into vectors.
pub trait ResultSink: Send {
    fn render(&mut self, result: &PipelineResult);
    fn notify(&mut self, message: &str);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no frame captured yet")]
    NoFrameYet,
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("enrollment task failed: {0}")]
    Join(String),
}

/// Drives a running pipeline until the frontend quits or the source ends.
///
/// Enrollment failures are reported through the sink and do not end the
/// session; only a quit, a closed command channel, or the pipeline stopping
/// on its own does.
pub struct SessionController {
    handle: PipelineHandle,
    store: StoreHandle,
    analyzer: Arc<Mutex<dyn FaceAnalyzer>>,
    db_path: PathBuf,
    selection: FaceSelection,
    commands: mpsc::Receiver<SessionCommand>,
}

impl SessionController {
    pub fn new(
        handle: PipelineHandle,
        store: StoreHandle,
        analyzer: Arc<Mutex<dyn FaceAnalyzer>>,
        db_path: PathBuf,
        selection: FaceSelection,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        Self {
            handle,
            store,
            analyzer,
            db_path,
            selection,
            commands,
        }
    }

    pub async fn run(mut self, sink: &mut dyn ResultSink) -> Result<(), PipelineError> {
        let mut results = self.handle.subscribe_results();
        let mut state_rx = self.handle.subscribe_state();

        loop {
            tokio::select! {
                changed = results.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let result = results.borrow_and_update().clone();
                    if let Some(result) = result {
                        sink.render(&result);
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        None | Some(SessionCommand::Quit) => break,
                        Some(SessionCommand::SetThreshold(threshold)) => {
                            self.handle.set_threshold(threshold);
                            sink.notify(&format!("threshold set to {threshold:.2}"));
                        }
                        Some(SessionCommand::Enroll { identity }) => {
                            match self.enroll_latest(&identity).await {
                                Ok(()) => {
                                    sink.notify(&format!("enrolled {identity}"));
                                }
                                Err(e) => {
                                    tracing::warn!(identity, error = %e, "enrollment failed");
                                    sink.notify(&format!("enrollment failed: {e}"));
                                }
                            }
                        }
                    }
                }
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == PipelineState::Stopped {
                        break;
                    }
                }
            }
        }

        self.handle.stop().await
    }

    /// Re-analyze the latest captured frame and persist the selected face
    /// under `identity`. The live database is updated in place, so the very
    /// next processed frame can already recognize the person.
    async fn enroll_latest(&self, identity: &str) -> Result<(), SessionError> {
        let frame = self.handle.latest_frame().ok_or(SessionError::NoFrameYet)?;
        let analyzer = Arc::clone(&self.analyzer);
        let store = self.store.clone();
        let db_path = self.db_path.clone();
        let selection = self.selection;
        let identity = identity.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            store.mutate(|s| {
                enroll_frame(s, &mut *guard, &identity, &frame, "live", selection)
            })?;
            store
                .snapshot()
                .save(&db_path)
                .map_err(EnrollError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| SessionError::Join(e.to_string()))?
    }
}
