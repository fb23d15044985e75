//! gaze-pipeline — Real-time recognition pipeline.
//!
//! Decouples frame capture from face analysis so a slow model never stalls
//! the source: capture runs on its own OS thread, inference on the tokio
//! runtime, and a single-slot channel between them keeps only the freshest
//! frame. Also hosts the shared store handle and the interactive session
//! loop built on top of the pipeline.

pub mod config;
pub mod pipeline;
pub mod session;
pub mod shared;
pub mod source;

pub use config::Config;
pub use pipeline::{
    CapturePipeline, DrainPolicy, PipelineConfig, PipelineError, PipelineHandle, PipelineResult,
    PipelineState, PipelineStats,
};
pub use session::{ResultSink, SessionCommand, SessionController, SessionError};
pub use shared::StoreHandle;
pub use source::{CaptureError, FramePoll, FrameSource, ImageDirSource};
