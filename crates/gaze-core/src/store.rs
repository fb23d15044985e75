//! Persistent embedding store.
//!
//! An insertion-ordered mapping from identity to enrolled face samples,
//! loaded once into memory, mutated only through its own operations, and
//! explicitly persisted. The on-disk format is self-describing JSON carrying
//! a schema version and the embedding dimension, so incompatible files are
//! detected deterministically instead of crashing or silently loading empty.

use crate::types::{Embedding, FaceSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Bumped on any incompatible change to the persisted layout.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains a non-finite component at index {index}")]
    NonFinite { index: usize },
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("corrupted database file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One enrolled identity and its append-only samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub samples: Vec<FaceSample>,
}

/// The embedding database.
///
/// Invariants: every sample has exactly `dim` finite components, and every
/// identity holds at least one sample — removing an identity removes all of
/// its samples, and an identity only comes into existence on its first
/// successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStore {
    schema_version: u32,
    dim: usize,
    people: Vec<Person>,
}

impl EmbeddingStore {
    /// Create an empty store with a fixed embedding dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            dim,
            people: Vec::new(),
        }
    }

    /// The fixed embedding dimension, set at construction or load.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of enrolled identities.
    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    /// Total sample count across all identities.
    pub fn total_samples(&self) -> usize {
        self.people.iter().map(|p| p.samples.len()).sum()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.people.iter().any(|p| p.name == identity)
    }

    /// Append a sample for `identity`, creating the identity on first use.
    ///
    /// Rejects vectors whose length disagrees with the store dimension and
    /// vectors with NaN/Inf components; nothing is written on failure.
    pub fn add(
        &mut self,
        identity: &str,
        embedding: Embedding,
        source: impl Into<String>,
        quality: Option<f32>,
    ) -> Result<Uuid, StoreError> {
        if embedding.dim() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.dim(),
            });
        }
        if let Some(index) = embedding.values.iter().position(|v| !v.is_finite()) {
            return Err(StoreError::NonFinite { index });
        }

        let sample = FaceSample::new(embedding, source, quality);
        let id = sample.id;

        match self.people.iter_mut().find(|p| p.name == identity) {
            Some(person) => person.samples.push(sample),
            None => self.people.push(Person {
                name: identity.to_string(),
                samples: vec![sample],
            }),
        }

        tracing::debug!(identity, sample = %id, "sample enrolled");
        Ok(id)
    }

    /// Remove an identity and all of its samples, returning how many were
    /// deleted. The store is unchanged when the identity is absent.
    pub fn remove(&mut self, identity: &str) -> Result<usize, StoreError> {
        let idx = self
            .people
            .iter()
            .position(|p| p.name == identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;

        let removed = self.people.remove(idx).samples.len();
        tracing::info!(identity, removed, "identity removed");
        Ok(removed)
    }

    /// Identities with their sample counts, in insertion order.
    pub fn list(&self) -> Vec<(String, usize)> {
        self.people
            .iter()
            .map(|p| (p.name.clone(), p.samples.len()))
            .collect()
    }

    /// All samples paired with their identity, in insertion order. This is
    /// the ordering the matcher's tie-break relies on.
    pub fn iter_samples(&self) -> impl Iterator<Item = (&str, &FaceSample)> {
        self.people
            .iter()
            .flat_map(|p| p.samples.iter().map(move |s| (p.name.as_str(), s)))
    }

    /// Check every stored vector for dimension and finiteness violations,
    /// plus identities that somehow hold zero samples (possible only in a
    /// hand-edited file). Reports findings without repairing anything.
    pub fn verify(&self) -> IntegrityReport {
        let mut issues = Vec::new();
        let mut checked = 0usize;

        for person in &self.people {
            if person.samples.is_empty() {
                issues.push(IntegrityIssue::EmptyIdentity {
                    identity: person.name.clone(),
                });
            }
            for sample in &person.samples {
                checked += 1;
                if sample.embedding.dim() != self.dim {
                    issues.push(IntegrityIssue::DimensionMismatch {
                        identity: person.name.clone(),
                        sample: sample.id,
                        expected: self.dim,
                        actual: sample.embedding.dim(),
                    });
                }
                if let Some(index) =
                    sample.embedding.values.iter().position(|v| !v.is_finite())
                {
                    issues.push(IntegrityIssue::NonFinite {
                        identity: person.name.clone(),
                        sample: sample.id,
                        index,
                    });
                }
            }
        }

        IntegrityReport {
            samples_checked: checked,
            issues,
        }
    }

    /// Counts and identities only — raw vectors never leave the store through
    /// a summary. The full dump is the `save` format, which a caller requests
    /// explicitly.
    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            generated_at: Utc::now(),
            dim: self.dim,
            total_people: self.len(),
            total_samples: self.total_samples(),
            people: self
                .people
                .iter()
                .map(|p| PersonSummary {
                    name: p.name.clone(),
                    samples: p.samples.len(),
                    last_enrolled_at: p.samples.iter().map(|s| s.created_at).max(),
                })
                .collect(),
        }
    }

    /// Load a store from disk.
    ///
    /// A missing file is an [`StoreError::Io`]; parse failures, schema
    /// mismatches, and dimension violations are [`StoreError::Corrupted`].
    /// A bad file never yields a partially populated or empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let store: EmbeddingStore =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if store.schema_version != SCHEMA_VERSION {
            return Err(StoreError::Corrupted {
                path: path.to_path_buf(),
                reason: format!(
                    "unsupported schema version {} (supported: {SCHEMA_VERSION})",
                    store.schema_version
                ),
            });
        }

        for (identity, sample) in store.iter_samples() {
            if sample.embedding.dim() != store.dim {
                return Err(StoreError::Corrupted {
                    path: path.to_path_buf(),
                    reason: format!(
                        "sample {} of '{identity}' has {} dimensions, file declares {}",
                        sample.id,
                        sample.embedding.dim(),
                        store.dim
                    ),
                });
            }
        }

        tracing::info!(
            path = %path.display(),
            people = store.len(),
            samples = store.total_samples(),
            "database loaded"
        );
        Ok(store)
    }

    /// Persist the store. The write is atomic: content goes to a temp file
    /// in the destination directory which is then renamed over the target,
    /// so a crash mid-write cannot corrupt an existing file.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| StoreError::Corrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_atomic(path, json.as_bytes())?;
        tracing::info!(path = %path.display(), samples = self.total_samples(), "database saved");
        Ok(())
    }

    /// Snapshot the store to a backup destination. Same atomic discipline
    /// as [`save`](Self::save).
    pub fn backup(&self, destination: &Path) -> Result<(), StoreError> {
        self.save(destination)?;
        tracing::info!(destination = %destination.display(), "database backed up");
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(io_err)
}

/// Outcome of an integrity check. Findings only — nothing is repaired.
#[derive(Debug)]
pub struct IntegrityReport {
    pub samples_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityIssue {
    DimensionMismatch {
        identity: String,
        sample: Uuid,
        expected: usize,
        actual: usize,
    },
    NonFinite {
        identity: String,
        sample: Uuid,
        index: usize,
    },
    EmptyIdentity {
        identity: String,
    },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::DimensionMismatch {
                identity,
                sample,
                expected,
                actual,
            } => write!(
                f,
                "'{identity}' sample {sample}: {actual} dimensions, expected {expected}"
            ),
            IntegrityIssue::NonFinite {
                identity,
                sample,
                index,
            } => write!(
                f,
                "'{identity}' sample {sample}: non-finite component at index {index}"
            ),
            IntegrityIssue::EmptyIdentity { identity } => {
                write!(f, "'{identity}' has zero samples")
            }
        }
    }
}

/// Export summary: statistics without biometric payloads.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub generated_at: DateTime<Utc>,
    pub dim: usize,
    pub total_people: usize,
    pub total_samples: usize,
    pub people: Vec<PersonSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonSummary {
    pub name: String,
    pub samples: usize,
    pub last_enrolled_at: Option<DateTime<Utc>>,
}
