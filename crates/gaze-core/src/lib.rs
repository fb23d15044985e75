//! gaze-core — Face embedding database and identification.
//!
//! Holds the persistent embedding store, the cosine similarity matcher, the
//! grayscale frame type, and the contract for the external face-analysis
//! engine. Capture hardware and the detection/embedding model live outside
//! this crate.

pub mod analyzer;
pub mod enroll;
pub mod frame;
pub mod matcher;
pub mod store;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, FaceSelection};
pub use frame::Frame;
pub use matcher::{verify_pair, CosineMatcher, Matcher};
pub use store::{EmbeddingStore, IntegrityReport, StoreError};
pub use types::{BoundingBox, Detection, Embedding, FaceSample, MatchResult, PairVerification};
