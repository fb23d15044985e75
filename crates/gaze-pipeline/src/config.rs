use crate::pipeline::{DrainPolicy, PipelineConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from environment variables.
pub struct Config {
    /// Path to the JSON embedding database.
    pub db_path: PathBuf,
    /// Embedding dimensionality the store is created with.
    pub embedding_dim: usize,
    /// Timeout in seconds for a call to the face engine service.
    pub engine_timeout_secs: u64,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from `GAZE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("gaze");

        let db_path = std::env::var("GAZE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.json"));

        let drain_policy = match std::env::var("GAZE_DRAIN_POLICY").as_deref() {
            Ok("discard") => DrainPolicy::DiscardInFlight,
            _ => DrainPolicy::FinishInFlight,
        };

        Self {
            db_path,
            embedding_dim: env_usize("GAZE_EMBEDDING_DIM", 512),
            engine_timeout_secs: env_u64("GAZE_ENGINE_TIMEOUT_SECS", 5),
            pipeline: PipelineConfig {
                poll_timeout: Duration::from_millis(env_u64("GAZE_POLL_TIMEOUT_MS", 250)),
                drain_policy,
                drain_timeout: Duration::from_millis(env_u64("GAZE_DRAIN_TIMEOUT_MS", 2000)),
                similarity_threshold: env_f32("GAZE_SIMILARITY_THRESHOLD", 0.40),
            },
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
