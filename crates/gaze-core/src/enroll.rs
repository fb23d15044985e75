//! Enrollment workflows: single frame, labeled images, and batch directory.

use crate::analyzer::{select_primary, AnalyzerError, FaceAnalyzer, FaceSelection, SelectionError};
use crate::frame::{Frame, FrameError};
use crate::store::{EmbeddingStore, StoreError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected, refusing to choose")]
    AmbiguousFaces { count: usize },
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SelectionError> for EnrollError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NoFaceDetected => EnrollError::NoFaceDetected,
            SelectionError::AmbiguousFaces { count } => EnrollError::AmbiguousFaces { count },
        }
    }
}

/// Analyze a frame, select the primary face per `policy`, and store its
/// embedding under `identity`. Nothing is written on any failure.
pub fn enroll_frame(
    store: &mut EmbeddingStore,
    analyzer: &mut dyn FaceAnalyzer,
    identity: &str,
    frame: &Frame,
    source: &str,
    policy: FaceSelection,
) -> Result<Uuid, EnrollError> {
    let detections = analyzer.analyze(frame)?;
    let face = select_primary(&detections, policy)?;
    let id = store.add(identity, face.embedding.clone(), source, Some(face.quality))?;
    tracing::info!(identity, source, quality = face.quality, "face enrolled");
    Ok(id)
}

/// Enroll one labeled image file.
pub fn enroll_image(
    store: &mut EmbeddingStore,
    analyzer: &mut dyn FaceAnalyzer,
    identity: &str,
    path: &Path,
    policy: FaceSelection,
) -> Result<Uuid, EnrollError> {
    let frame = Frame::load(path)?;
    enroll_frame(
        store,
        analyzer,
        identity,
        &frame,
        &path.display().to_string(),
        policy,
    )
}

/// Outcome of a batch enrollment: how many samples went in, and which inputs
/// were skipped and why.
#[derive(Debug, Default)]
pub struct EnrollReport {
    pub added: usize,
    pub skipped: Vec<(PathBuf, String)>,
}

/// Enroll a batch of image files under one identity.
///
/// Per-file failures (unreadable image, no face, ambiguous faces) are
/// recorded in the report and do not abort the batch; store-level failures
/// such as a dimension mismatch are recorded the same way since they affect
/// only that file.
pub fn enroll_images(
    store: &mut EmbeddingStore,
    analyzer: &mut dyn FaceAnalyzer,
    identity: &str,
    paths: &[PathBuf],
    policy: FaceSelection,
) -> Result<EnrollReport, EnrollError> {
    let mut report = EnrollReport::default();
    for path in paths {
        match enroll_image(store, analyzer, identity, path, policy) {
            Ok(_) => report.added += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "image skipped");
                report.skipped.push((path.clone(), e.to_string()));
            }
        }
    }
    Ok(report)
}

/// Enroll a directory-of-directories: one subdirectory per identity, named
/// after it, containing that person's images.
pub fn enroll_directory(
    store: &mut EmbeddingStore,
    analyzer: &mut dyn FaceAnalyzer,
    root: &Path,
    policy: FaceSelection,
) -> Result<EnrollReport, EnrollError> {
    let entries = std::fs::read_dir(root).map_err(|source| EnrollError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut report = EnrollReport::default();

    // Sort identities by name so batch runs are reproducible regardless of
    // directory iteration order.
    let mut person_dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    person_dirs.sort();

    for person_dir in person_dirs {
        let Some(identity) = person_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let images = image_files(&person_dir)?;
        let sub = enroll_images(store, analyzer, identity, &images, policy)?;
        report.added += sub.added;
        report.skipped.extend(sub.skipped);
    }

    tracing::info!(
        root = %root.display(),
        added = report.added,
        skipped = report.skipped.len(),
        "directory enrollment finished"
    );
    Ok(report)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let entries = std::fs::read_dir(dir).map_err(|source| EnrollError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Detection, Embedding};

    /// Analyzer returning a scripted response per call, in order.
    struct ScriptedAnalyzer {
        responses: Vec<Vec<Detection>>,
        calls: usize,
    }

    impl ScriptedAnalyzer {
        fn new(responses: Vec<Vec<Detection>>) -> Self {
            Self { responses, calls: 0 }
        }
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, _frame: &Frame) -> Result<Vec<Detection>, AnalyzerError> {
            let response = self
                .responses
                .get(self.calls)
                .cloned()
                .unwrap_or_default();
            self.calls += 1;
            Ok(response)
        }
    }

    fn det(side: f32, values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: side, height: side },
            embedding: Embedding::new(values),
            quality: 0.9,
            age: None,
            gender: None,
        }
    }

    fn frame() -> Frame {
        Frame::from_gray(vec![128u8; 16], 4, 4).unwrap()
    }

    #[test]
    fn test_enroll_frame_stores_sample() {
        let mut store = EmbeddingStore::new(2);
        let mut analyzer = ScriptedAnalyzer::new(vec![vec![det(20.0, vec![1.0, 0.0])]]);

        enroll_frame(
            &mut store,
            &mut analyzer,
            "Alice",
            &frame(),
            "capture",
            FaceSelection::LargestBox,
        )
        .unwrap();

        assert_eq!(store.list(), vec![("Alice".to_string(), 1)]);
    }

    #[test]
    fn test_enroll_frame_no_face_writes_nothing() {
        let mut store = EmbeddingStore::new(2);
        let mut analyzer = ScriptedAnalyzer::new(vec![vec![]]);

        let result = enroll_frame(
            &mut store,
            &mut analyzer,
            "Alice",
            &frame(),
            "capture",
            FaceSelection::LargestBox,
        );

        assert!(matches!(result, Err(EnrollError::NoFaceDetected)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_frame_ambiguous_writes_nothing() {
        let mut store = EmbeddingStore::new(2);
        let mut analyzer = ScriptedAnalyzer::new(vec![vec![
            det(20.0, vec![1.0, 0.0]),
            det(30.0, vec![0.0, 1.0]),
        ]]);

        let result = enroll_frame(
            &mut store,
            &mut analyzer,
            "Alice",
            &frame(),
            "capture",
            FaceSelection::RejectAmbiguous,
        );

        assert!(matches!(result, Err(EnrollError::AmbiguousFaces { count: 2 })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_frame_picks_largest_face() {
        let mut store = EmbeddingStore::new(2);
        let mut analyzer = ScriptedAnalyzer::new(vec![vec![
            det(20.0, vec![1.0, 0.0]),
            det(80.0, vec![0.0, 1.0]),
        ]]);

        enroll_frame(
            &mut store,
            &mut analyzer,
            "Alice",
            &frame(),
            "capture",
            FaceSelection::LargestBox,
        )
        .unwrap();

        let (_, sample) = store.iter_samples().next().unwrap();
        assert_eq!(sample.embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_enroll_frame_dimension_mismatch_writes_nothing() {
        let mut store = EmbeddingStore::new(4);
        let mut analyzer = ScriptedAnalyzer::new(vec![vec![det(20.0, vec![1.0, 0.0])]]);

        let result = enroll_frame(
            &mut store,
            &mut analyzer,
            "Alice",
            &frame(),
            "capture",
            FaceSelection::LargestBox,
        );

        assert!(matches!(
            result,
            Err(EnrollError::Store(StoreError::DimensionMismatch { .. }))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_directory_batch() {
        let dir = tempfile::tempdir().unwrap();
        let alice = dir.path().join("Alice");
        let bob = dir.path().join("Bob");
        std::fs::create_dir(&alice).unwrap();
        std::fs::create_dir(&bob).unwrap();

        // 2x2 gray PNGs so Frame::load succeeds.
        let img = image::GrayImage::from_pixel(2, 2, image::Luma([128u8]));
        img.save(alice.join("one.png")).unwrap();
        img.save(alice.join("two.png")).unwrap();
        img.save(bob.join("one.png")).unwrap();
        std::fs::write(bob.join("notes.txt"), "not an image").unwrap();

        // Alice dirs sorts first; second Alice image yields no face.
        let mut analyzer = ScriptedAnalyzer::new(vec![
            vec![det(20.0, vec![1.0, 0.0])],
            vec![],
            vec![det(20.0, vec![0.0, 1.0])],
        ]);

        let mut store = EmbeddingStore::new(2);
        let report = enroll_directory(
            &mut store,
            &mut analyzer,
            dir.path(),
            FaceSelection::LargestBox,
        )
        .unwrap();

        assert_eq!(report.added, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            store.list(),
            vec![("Alice".to_string(), 1), ("Bob".to_string(), 1)]
        );
    }
}
