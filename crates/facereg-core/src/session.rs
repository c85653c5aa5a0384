//! Recognition session. Runs the per-face match-or-enroll loop for one image
//! and is the only part of the engine that talks to the external collaborators
//! (face provider, renderer, thumbnail sink).

use crate::enrollment::{Enroller, EnrollmentOutcome};
use crate::matcher::{MatchResult, Matcher};
use crate::render::RenderError;
use crate::store::{IdentityStore, StoreBackend};
use crate::types::{Detection, Embedding, FaceOutcome, LabeledFace, RecognitionResult};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label used when no usable file stem can be derived.
pub const FALLBACK_LABEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("cannot read detections from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed detections in {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// External face detection + embedding capability.
pub trait FaceProvider: Send {
    /// Detect faces in `pixels` (decoded from `source`) and return one
    /// embedding per face, in detection order. Zero faces is a valid answer.
    fn detect(&mut self, source: &Path, pixels: &RgbImage) -> Result<Vec<Detection>, ProviderError>;
}

/// External annotation renderer. Returns where the artifact was written, if anywhere.
pub trait Renderer: Send {
    fn render(
        &mut self,
        source: &Path,
        pixels: &RgbImage,
        faces: &[LabeledFace],
    ) -> Result<Option<PathBuf>, RenderError>;
}

/// Receives a crop of every newly enrolled face.
pub trait ThumbnailSink: Send {
    fn save(&mut self, name: &str, crop: &RgbImage, embedding: &Embedding) -> Result<PathBuf, RenderError>;
}

/// Renderer that draws nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenderer;

impl Renderer for NoopRenderer {
    fn render(&mut self, _: &Path, _: &RgbImage, _: &[LabeledFace]) -> Result<Option<PathBuf>, RenderError> {
        Ok(None)
    }
}

/// Why an image produced no recognition result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkipReason {
    #[error("input image does not exist")]
    Missing,
    #[error("cannot decode image: {0}")]
    Undecodable(String),
    #[error("face provider failed: {0}")]
    Provider(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("face provider returned an empty embedding")]
    EmptyEmbedding,
    #[error("face provider returned an embedding with NaN or infinite values")]
    NonFiniteEmbedding,
    #[error("identity store refused an embedding: {0}")]
    Rejected(String),
}

/// Per-image outcome. Skips are not fatal to a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Recognized {
        result: RecognitionResult,
        /// Annotated artifact, when the renderer produced one.
        annotated: Option<PathBuf>,
    },
    Skipped {
        image: String,
        reason: SkipReason,
    },
}

impl ImageOutcome {
    pub fn image(&self) -> &str {
        match self {
            ImageOutcome::Recognized { result, .. } => &result.image,
            ImageOutcome::Skipped { image, .. } => image,
        }
    }

    /// Labels in detection order; empty for skipped images.
    pub fn names(&self) -> Vec<String> {
        match self {
            ImageOutcome::Recognized { result, .. } => result.names().map(str::to_string).collect(),
            ImageOutcome::Skipped { .. } => Vec::new(),
        }
    }

    pub fn unpersisted(&self) -> usize {
        match self {
            ImageOutcome::Recognized { result, .. } => result.unpersisted,
            ImageOutcome::Skipped { .. } => 0,
        }
    }
}

/// Derive an identity label from an image path: its file stem.
pub fn label_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_LABEL.to_string())
}

/// Orchestrates matching and enrollment for one image at a time.
pub struct RecognitionSession<M: Matcher> {
    matcher: M,
    enroller: Enroller,
    provider: Box<dyn FaceProvider>,
    renderer: Box<dyn Renderer>,
    thumbnails: Option<Box<dyn ThumbnailSink>>,
}

impl<M: Matcher> RecognitionSession<M> {
    pub fn new(matcher: M, provider: Box<dyn FaceProvider>) -> Self {
        Self {
            matcher,
            enroller: Enroller,
            provider,
            renderer: Box::new(NoopRenderer),
            thumbnails: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_thumbnails(mut self, sink: Box<dyn ThumbnailSink>) -> Self {
        self.thumbnails = Some(sink);
        self
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    /// Label every detection, enrolling unmatched faces under `label_hint`.
    ///
    /// Each face is matched against the store's current snapshot, so a face
    /// enrolled earlier in the same image is visible to the faces after it.
    /// Every unmatched face in the image gets the same `label_hint`.
    ///
    /// Detections are validated as a whole first: if any embedding is empty,
    /// non-finite or of the wrong dimension, the image is refused and the
    /// store is left untouched.
    pub fn recognize<B: StoreBackend>(
        &self,
        store: &mut IdentityStore<B>,
        image: &str,
        detections: &[Detection],
        label_hint: &str,
    ) -> Result<RecognitionResult, SkipReason> {
        validate_detections(store.snapshot().dim(), detections)?;

        let mut result = RecognitionResult::empty(image);

        for detection in detections {
            let face = match self.matcher.find(&detection.embedding, store.snapshot()) {
                MatchResult::Found { name, distance, .. } => {
                    tracing::info!(name = %name, distance, "existing face recognized");
                    LabeledFace {
                        name,
                        bbox: detection.bbox,
                        outcome: FaceOutcome::Matched { distance },
                    }
                }
                MatchResult::NotFound => {
                    match self
                        .enroller
                        .enroll(store, detection.embedding.clone(), label_hint)
                    {
                        EnrollmentOutcome::Persisted => {}
                        EnrollmentOutcome::Deferred(_) => result.unpersisted += 1,
                        EnrollmentOutcome::Rejected(e) => return Err(SkipReason::Rejected(e.to_string())),
                    }
                    LabeledFace {
                        name: label_hint.to_string(),
                        bbox: detection.bbox,
                        outcome: FaceOutcome::Enrolled,
                    }
                }
            };
            result.faces.push(face);
        }

        Ok(result)
    }

    /// Process one image file end to end. Failures local to this image are
    /// reported as [`ImageOutcome::Skipped`]; nothing here aborts a batch.
    pub fn process<B: StoreBackend>(
        &mut self,
        store: &mut IdentityStore<B>,
        path: &Path,
        image_ref: &str,
    ) -> ImageOutcome {
        let skipped = |reason: SkipReason| {
            tracing::warn!(image = %path.display(), %reason, "skipping image");
            ImageOutcome::Skipped {
                image: image_ref.to_string(),
                reason,
            }
        };

        if !path.exists() {
            return skipped(SkipReason::Missing);
        }

        let pixels = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => return skipped(SkipReason::Undecodable(e.to_string())),
        };

        let detections = match self.provider.detect(path, &pixels) {
            Ok(d) => d,
            Err(e) => return skipped(SkipReason::Provider(e.to_string())),
        };

        if detections.is_empty() {
            tracing::info!(image = %path.display(), "no faces detected in the image");
            return ImageOutcome::Recognized {
                result: RecognitionResult::empty(image_ref),
                annotated: None,
            };
        }

        let label = label_from_path(path);
        let result = match self.recognize(store, image_ref, &detections, &label) {
            Ok(result) => result,
            Err(reason) => return skipped(reason),
        };

        if let Some(sink) = self.thumbnails.as_mut() {
            for (face, detection) in result.faces.iter().zip(&detections) {
                if face.outcome != FaceOutcome::Enrolled {
                    continue;
                }
                let b = face.bbox.clamp_to(pixels.width(), pixels.height());
                if b.width() == 0 || b.height() == 0 {
                    continue;
                }
                let crop = image::imageops::crop_imm(&pixels, b.left, b.top, b.width(), b.height())
                    .to_image();
                if let Err(e) = sink.save(&face.name, &crop, &detection.embedding) {
                    tracing::warn!(name = %face.name, error = %e, "failed to save face thumbnail");
                }
            }
        }

        let annotated = match self.renderer.render(path, &pixels, &result.faces) {
            Ok(out) => {
                if let Some(out) = &out {
                    tracing::info!(output = %out.display(), "processed image saved");
                }
                out
            }
            Err(e) => {
                tracing::warn!(image = %path.display(), error = %e, "failed to render annotated image");
                None
            }
        };

        ImageOutcome::Recognized { result, annotated }
    }
}

/// All embeddings in one image must be finite and share the store's
/// dimension (or each other's, while the store is empty).
fn validate_detections(store_dim: Option<usize>, detections: &[Detection]) -> Result<(), SkipReason> {
    let mut expected = store_dim;
    for d in detections {
        let actual = d.embedding.dim();
        if actual == 0 {
            return Err(SkipReason::EmptyEmbedding);
        }
        if !d.embedding.is_finite() {
            return Err(SkipReason::NonFiniteEmbedding);
        }
        match expected {
            Some(exp) if exp != actual => {
                return Err(SkipReason::DimensionMismatch { expected: exp, actual });
            }
            Some(_) => {}
            None => expected = Some(actual),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::matcher::EuclideanMatcher;
    use crate::types::BoundingBox;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn det(v: &[f32], left: u32) -> Detection {
        Detection {
            bbox: BoundingBox::new(2, left + 4, 6, left),
            embedding: emb(v),
        }
    }

    /// Provider that returns canned detections keyed by file name.
    struct FixedProvider(HashMap<String, Vec<Detection>>);

    impl FaceProvider for FixedProvider {
        fn detect(&mut self, source: &Path, _: &RgbImage) -> Result<Vec<Detection>, ProviderError> {
            let key = source.file_name().unwrap().to_string_lossy().into_owned();
            Ok(self.0.get(&key).cloned().unwrap_or_default())
        }
    }

    struct FailingProvider;

    impl FaceProvider for FailingProvider {
        fn detect(&mut self, source: &Path, _: &RgbImage) -> Result<Vec<Detection>, ProviderError> {
            Err(ProviderError::Malformed {
                path: source.display().to_string(),
                reason: "boom".into(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<(String, u32, u32)>>>);

    impl ThumbnailSink for RecordingSink {
        fn save(&mut self, name: &str, crop: &RgbImage, _: &Embedding) -> Result<PathBuf, RenderError> {
            self.0.lock().unwrap().push((name.to_string(), crop.width(), crop.height()));
            Ok(PathBuf::from(format!("{name}.png")))
        }
    }

    fn session(provider: Box<dyn FaceProvider>) -> RecognitionSession<EuclideanMatcher> {
        RecognitionSession::new(EuclideanMatcher::new(0.6), provider)
    }

    fn empty_session() -> RecognitionSession<EuclideanMatcher> {
        session(Box::new(FixedProvider(HashMap::new())))
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        RgbImage::new(16, 16).save(&path).unwrap();
        path
    }

    #[test]
    fn test_label_from_path() {
        assert_eq!(label_from_path(Path::new("/in/alice.jpg")), "alice");
        assert_eq!(label_from_path(Path::new("bob.smith.png")), "bob.smith");
        assert_eq!(label_from_path(Path::new("/")), FALLBACK_LABEL);
    }

    #[test]
    fn test_zero_detections_leaves_store_unchanged() {
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        store.append(emb(&[0.0, 0.0]), "alice").unwrap();
        let before = store.snapshot().clone();

        let result = empty_session().recognize(&mut store, "img", &[], "hint").unwrap();
        assert!(result.faces.is_empty());
        assert_eq!(store.snapshot(), &before);
    }

    #[test]
    fn test_within_image_consistency() {
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let detections = vec![det(&[0.0, 0.0], 0), det(&[0.1, 0.0], 10)];
        let result = empty_session().recognize(&mut store, "img", &detections, "party").unwrap();

        assert_eq!(result.names().collect::<Vec<_>>(), vec!["party", "party"]);
        assert_eq!(result.faces[0].outcome, FaceOutcome::Enrolled);
        assert!(matches!(result.faces[1].outcome, FaceOutcome::Matched { .. }));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_unmatched_faces_share_label_hint() {
        // Known limitation: distinct new faces in one image collapse to one label.
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let detections = vec![det(&[0.0, 0.0], 0), det(&[5.0, 5.0], 10)];
        let result = empty_session().recognize(&mut store, "img", &detections, "party").unwrap();

        assert_eq!(result.enrolled_count(), 2);
        assert_eq!(store.snapshot().names(), &["party", "party"]);
        assert_eq!(store.snapshot().identities(), vec![("party".to_string(), 2)]);
    }

    #[test]
    fn test_results_preserve_detection_order() {
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        store.append(emb(&[0.0, 0.0]), "alice").unwrap();
        store.append(emb(&[3.0, 3.0]), "bob").unwrap();
        let detections = vec![det(&[3.0, 3.1], 0), det(&[9.0, 9.0], 10), det(&[0.1, 0.0], 20)];
        let result = empty_session().recognize(&mut store, "img", &detections, "new").unwrap();

        assert_eq!(result.names().collect::<Vec<_>>(), vec!["bob", "new", "alice"]);
        let lefts: Vec<u32> = result.faces.iter().map(|f| f.bbox.left).collect();
        assert_eq!(lefts, vec![0, 10, 20]);
    }

    #[test]
    fn test_deferred_enrollment_counted() {
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        store.backend_mut().fail_writes(true);
        let result = empty_session().recognize(&mut store, "img", &[det(&[0.0], 0)], "x").unwrap();
        assert_eq!(result.unpersisted, 1);
        assert_eq!(store.pending(), 1);
    }

    #[test]
    fn test_process_missing_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let outcome = empty_session().process(&mut store, &dir.path().join("nope.jpg"), "nope.jpg");
        assert_eq!(
            outcome,
            ImageOutcome::Skipped {
                image: "nope.jpg".into(),
                reason: SkipReason::Missing
            }
        );
        assert!(outcome.names().is_empty());
    }

    #[test]
    fn test_process_undecodable_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let outcome = empty_session().process(&mut store, &path, "broken.png");
        assert!(matches!(
            outcome,
            ImageOutcome::Skipped { reason: SkipReason::Undecodable(_), .. }
        ));
    }

    #[test]
    fn test_process_provider_failure_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png");
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let outcome = session(Box::new(FailingProvider)).process(&mut store, &path, "a.png");
        assert!(matches!(
            outcome,
            ImageOutcome::Skipped { reason: SkipReason::Provider(_), .. }
        ));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_process_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "empty.png");
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let outcome = empty_session().process(&mut store, &path, "empty.png");
        assert_eq!(outcome.names(), Vec::<String>::new());
        assert!(matches!(outcome, ImageOutcome::Recognized { .. }));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_process_dimension_mismatch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "carol.png");
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        store.append(emb(&[0.0, 0.0]), "alice").unwrap();

        let mut canned = HashMap::new();
        canned.insert("carol.png".to_string(), vec![det(&[0.0, 0.0, 0.0], 0)]);
        let outcome = session(Box::new(FixedProvider(canned))).process(&mut store, &path, "carol.png");
        assert!(matches!(
            outcome,
            ImageOutcome::Skipped {
                reason: SkipReason::DimensionMismatch { expected: 2, actual: 3 },
                ..
            }
        ));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_process_enrolls_under_file_stem_and_saves_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "dave.png");
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        store.append(emb(&[0.0, 0.0]), "alice").unwrap();

        let mut canned = HashMap::new();
        canned.insert(
            "dave.png".to_string(),
            vec![det(&[0.05, 0.0], 0), det(&[4.0, 4.0], 8)],
        );
        let sink = RecordingSink::default();
        let mut s = session(Box::new(FixedProvider(canned))).with_thumbnails(Box::new(sink.clone()));
        let outcome = s.process(&mut store, &path, "/output/dave.png");

        assert_eq!(outcome.image(), "/output/dave.png");
        assert_eq!(outcome.names(), vec!["alice".to_string(), "dave".to_string()]);
        assert_eq!(store.snapshot().names(), &["alice", "dave"]);
        assert_eq!(*sink.0.lock().unwrap(), vec![("dave".to_string(), 4, 4)]);
    }

    #[test]
    fn test_validate_detections_empty_store_uses_first_detection() {
        let ds = vec![det(&[0.0, 1.0], 0), det(&[0.0], 1)];
        assert_eq!(
            validate_detections(None, &ds),
            Err(SkipReason::DimensionMismatch { expected: 2, actual: 1 })
        );
        assert_eq!(validate_detections(None, &ds[..1]), Ok(()));
        assert_eq!(validate_detections(Some(2), &[det(&[], 0)]), Err(SkipReason::EmptyEmbedding));
        assert_eq!(
            validate_detections(Some(2), &[det(&[0.0, f32::NAN], 0)]),
            Err(SkipReason::NonFiniteEmbedding)
        );
    }

    #[test]
    fn test_recognize_refuses_wrong_dimension_without_matching() {
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        store.append(emb(&[0.0, 0.0]), "alice").unwrap();

        // A truncated distance would put [0, 0, 50] at 0.0 from alice.
        let detections = vec![det(&[0.0, 0.0, 50.0], 0), det(&[9.0, 9.0, 9.0], 10)];
        let err = empty_session()
            .recognize(&mut store, "img", &detections, "bob")
            .unwrap_err();
        assert_eq!(err, SkipReason::DimensionMismatch { expected: 2, actual: 3 });
        assert_eq!(store.snapshot().names(), &["alice"]);
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_recognize_refuses_non_finite_embedding() {
        let mut store = IdentityStore::load(MemoryBackend::new()).unwrap();
        let detections = vec![det(&[0.0, 0.0], 0), det(&[f32::INFINITY, 0.0], 10)];
        let err = empty_session()
            .recognize(&mut store, "img", &detections, "bob")
            .unwrap_err();
        assert_eq!(err, SkipReason::NonFiniteEmbedding);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_process_overflowing_sidecar_keeps_json_store_loadable() {
        use crate::backend::JsonFileBackend;
        use crate::provider::SidecarProvider;

        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "bob.png");
        std::fs::write(
            dir.path().join("bob.faces.json"),
            r#"[{"box": {"top": 0, "right": 4, "bottom": 4, "left": 0}, "embedding": [1e39, 0.0]}]"#,
        )
        .unwrap();
        let store_path = dir.path().join("known_faces.json");
        let mut store = IdentityStore::load(JsonFileBackend::new(&store_path)).unwrap();

        let outcome = session(Box::new(SidecarProvider)).process(&mut store, &path, "bob.png");
        assert!(matches!(
            outcome,
            ImageOutcome::Skipped { reason: SkipReason::NonFiniteEmbedding, .. }
        ));
        assert!(store.snapshot().is_empty());

        store.append(emb(&[0.5, 0.0]), "carol").unwrap();
        let reloaded = IdentityStore::load(JsonFileBackend::new(&store_path)).unwrap();
        assert_eq!(reloaded.snapshot().names(), &["carol"]);
    }
}
