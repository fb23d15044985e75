use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Box area in square pixels. Negative extents clamp to zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (typically 512-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Vector length.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True if every component is finite (no NaN/Inf).
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Pure function of
    /// the two vectors — never normalizes or otherwise mutates either side.
    /// Mismatched lengths and zero vectors yield 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// Reported gender for a detected face, when the analyzer provides one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

/// One detected face from the analyzer: box, embedding, and optional
/// demographic/quality attributes.
///
/// Serde derives double as the wire schema for out-of-process analyzers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    /// Detection confidence in [0, 1].
    pub quality: f32,
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub gender: Option<Gender>,
}

/// A stored embedding with its capture metadata. Immutable once enrolled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSample {
    pub id: Uuid,
    pub embedding: Embedding,
    /// Source filename or capture description, for traceability.
    pub source: String,
    /// Detection quality at capture time, if known.
    pub quality: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl FaceSample {
    pub fn new(embedding: Embedding, source: impl Into<String>, quality: Option<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            embedding,
            source: source.into(),
            quality,
            created_at: Utc::now(),
        }
    }
}

/// Result of identifying one detection against the store.
///
/// `identity == None` is the "unknown" sentinel; the similarity score of the
/// best candidate is reported either way, for diagnostics. Ephemeral — never
/// persisted.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub identity: Option<String>,
    /// Cosine similarity of the best candidate, in [-1, 1].
    pub similarity: f32,
    /// The bounding box the match was computed against.
    pub bbox: BoundingBox,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Result of a 1:1 comparison between two embeddings.
#[derive(Debug, Clone, Copy)]
pub struct PairVerification {
    pub similarity: f32,
    pub matched: bool,
}
