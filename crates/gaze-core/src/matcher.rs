//! Identification and 1:1 verification over the embedding store.

use crate::store::EmbeddingStore;
use crate::types::{Detection, Embedding, MatchResult, PairVerification};

/// Strategy for identifying a detected face against the store.
pub trait Matcher {
    fn identify(
        &self,
        probe: &Detection,
        store: &EmbeddingStore,
        threshold: f32,
    ) -> MatchResult;
}

/// Full-scan cosine similarity matcher.
///
/// Scans every stored sample; the single best similarity determines the
/// identity. Exact ties resolve to the earliest-enrolled sample (strict `>`
/// over the store's insertion order), never to map iteration order. Pure
/// read path — stored vectors are never normalized or otherwise touched.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn identify(
        &self,
        probe: &Detection,
        store: &EmbeddingStore,
        threshold: f32,
    ) -> MatchResult {
        let mut best_similarity = f32::NEG_INFINITY;
        let mut best_identity: Option<&str> = None;

        for (identity, sample) in store.iter_samples() {
            let similarity = probe.embedding.similarity(&sample.embedding);
            if similarity > best_similarity {
                best_similarity = similarity;
                best_identity = Some(identity);
            }
        }

        if best_identity.is_none() {
            // Empty store: nothing to compare against.
            return MatchResult {
                identity: None,
                similarity: 0.0,
                bbox: probe.bbox,
            };
        }

        let identity = if best_similarity >= threshold {
            best_identity.map(str::to_string)
        } else {
            None
        };

        MatchResult {
            identity,
            similarity: best_similarity,
            bbox: probe.bbox,
        }
    }
}

/// Compare two embeddings directly — same similarity function as
/// identification, applied 1:1.
pub fn verify_pair(a: &Embedding, b: &Embedding, threshold: f32) -> PairVerification {
    let similarity = a.similarity(b);
    PairVerification {
        similarity,
        matched: similarity >= threshold,
    }
}
