//! Enrollment and recognition orchestration.
//!
//! `AttendanceEngine` owns the ledger handle and the shared gallery. The
//! gallery sits behind an `RwLock`: recognition matches under a read lock,
//! enrollment swaps entries under a write lock, so a recognition cycle sees
//! the gallery either before or after an enrollment, never halfway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Local, NaiveDate, Utc};
use rollcall_core::{
    BoundingBox, Embedding, EmbeddingExtractor, EuclideanMatcher, ExtractError, FaceLocator,
    FacePipeline, FaceRegion, Gallery, GalleryError, Identity, LoadReport, Matcher,
};
use rollcall_hw::{Frame, FrameSource};
use rollcall_ledger::{Ledger, LedgerError};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::display::RecognitionSink;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("no face detected in reference image")]
    NoFaceDetected,
    #[error("cannot read reference image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to store reference image: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor failed: {0}")]
    Extractor(String),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("gallery lock poisoned")]
    GalleryPoisoned,
    #[error("ledger: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for EnrollmentError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::DuplicateIdentity(id) => Self::DuplicateIdentity(id),
            LedgerError::UnknownIdentity(id) => Self::UnknownIdentity(id),
            other => Self::Ledger(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("extractor failed: {0}")]
    Extractor(String),
    #[error("gallery lock poisoned")]
    GalleryPoisoned,
}

/// Enrollment form contents.
#[derive(Debug, Clone, Default)]
pub struct EnrollRequest {
    pub id: String,
    pub display_name: String,
    pub metadata: BTreeMap<String, String>,
    pub reference_image: PathBuf,
}

/// What became of one located face.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    Known {
        identity_id: String,
        display_name: String,
        distance: f32,
        /// `true` only for the first sighting of the day.
        recorded: bool,
    },
    Unknown {
        distance: f32,
    },
}

/// Per-face result handed to the display.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionEvent {
    pub bbox: BoundingBox,
    pub outcome: RecognitionOutcome,
}

impl RecognitionEvent {
    pub fn label(&self) -> &str {
        match &self.outcome {
            RecognitionOutcome::Known { identity_id, .. } => identity_id,
            RecognitionOutcome::Unknown { .. } => "Unknown",
        }
    }

    pub fn recorded(&self) -> bool {
        matches!(self.outcome, RecognitionOutcome::Known { recorded: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The stop signal was raised.
    #[default]
    StopRequested,
    /// The frame source failed or ran out.
    CaptureEnded,
}

/// Counters for one run of the recognition loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub frames: usize,
    pub dark_frames: usize,
    pub faces: usize,
    pub recorded: usize,
    pub stopped_by: StopReason,
}

/// Copies reference images into the managed image directory.
#[derive(Debug, Clone)]
struct ReferenceImages {
    dir: PathBuf,
}

impl ReferenceImages {
    fn store(&self, identity_id: &str, source: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png");
        let stem = format!("{}-{}", file_safe(identity_id), Utc::now().format("%Y%m%d%H%M%S%6f"));
        let mut dest = self.dir.join(format!("{stem}.{ext}"));
        let mut n = 1;
        while dest.exists() {
            dest = self.dir.join(format!("{stem}-{n}.{ext}"));
            n += 1;
        }
        std::fs::copy(source, &dest)?;
        Ok(dest)
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove reference image");
        }
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

pub struct AttendanceEngine {
    ledger: Arc<Ledger>,
    gallery: Arc<RwLock<Gallery>>,
    matcher: EuclideanMatcher,
    threshold: f32,
    images: ReferenceImages,
    required_metadata: Vec<String>,
    recompute_on_load: bool,
    warmup_frames: usize,
    skip_dark_frames: bool,
    today: fn() -> NaiveDate,
}

impl AttendanceEngine {
    pub fn new(ledger: Arc<Ledger>, config: &Config) -> Self {
        Self {
            ledger,
            gallery: Arc::new(RwLock::new(Gallery::new())),
            matcher: EuclideanMatcher::new(config.match_policy),
            threshold: config.match_threshold,
            images: ReferenceImages {
                dir: config.image_dir.clone(),
            },
            required_metadata: config.required_metadata.clone(),
            recompute_on_load: config.recompute_on_load,
            warmup_frames: config.warmup_frames,
            skip_dark_frames: config.skip_dark_frames,
            today: local_today,
        }
    }

    /// Override the calendar used by [`run`](Self::run).
    pub fn with_clock(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Copy of the current gallery.
    pub fn gallery_snapshot(&self) -> Result<Gallery, EngineError> {
        Ok(self.gallery.read().map_err(|_| EngineError::GalleryPoisoned)?.clone())
    }

    fn read_gallery(&self) -> Result<RwLockReadGuard<'_, Gallery>, EngineError> {
        self.gallery.read().map_err(|_| EngineError::GalleryPoisoned)
    }

    fn write_gallery(&self) -> Result<RwLockWriteGuard<'_, Gallery>, EnrollmentError> {
        self.gallery.write().map_err(|_| EnrollmentError::GalleryPoisoned)
    }

    /// Rebuild the gallery from every persisted identity.
    ///
    /// Stored embeddings are reused unless recomputation is configured or the
    /// extractor reports a different model version. Recomputed embeddings are
    /// written back to the ledger. Identities that cannot be embedded are
    /// skipped and reported.
    pub fn bootstrap(&self, extractor: &mut dyn EmbeddingExtractor) -> Result<LoadReport, EngineError> {
        let identities = self.ledger.list_identities()?;
        let current_version = extractor.model_version().map(str::to_owned);
        let recompute_all = self.recompute_on_load;
        let mut refreshed: Vec<(String, Embedding)> = Vec::new();

        let mut gallery = Gallery::new();
        let report = gallery.load(&identities, |identity| {
            let stale = match (&identity.embedding.model_version, &current_version) {
                (Some(stored), Some(current)) => stored != current,
                _ => false,
            };
            if !(recompute_all || stale) {
                return Ok(identity.embedding.clone());
            }
            tracing::debug!(id = %identity.id, stale, "recomputing embedding");
            let region = FaceRegion::open(&identity.reference_image).map_err(|e| {
                ExtractError::Backend(format!(
                    "reference image {}: {e}",
                    identity.reference_image.display()
                ))
            })?;
            let embedding = extractor.extract(&region)?;
            refreshed.push((identity.id.clone(), embedding.clone()));
            Ok(embedding)
        });

        for (id, embedding) in &refreshed {
            if gallery.get(id) == Some(embedding) {
                self.ledger.update_embedding(id, embedding)?;
            }
        }

        *self.gallery.write().map_err(|_| EngineError::GalleryPoisoned)? = gallery;

        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped.len(),
            refreshed = refreshed.len(),
            "gallery rebuilt"
        );
        Ok(report)
    }

    fn validate(&self, request: &EnrollRequest) -> Result<(), EnrollmentError> {
        if request.id.trim().is_empty() {
            return Err(EnrollmentError::MissingField("id".into()));
        }
        if request.display_name.trim().is_empty() {
            return Err(EnrollmentError::MissingField("display_name".into()));
        }
        if request.reference_image.as_os_str().is_empty() {
            return Err(EnrollmentError::MissingField("reference_image".into()));
        }
        for key in &self.required_metadata {
            let present = request
                .metadata
                .get(key)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(EnrollmentError::MissingField(key.clone()));
            }
        }
        Ok(())
    }

    fn embed_reference(
        &self,
        path: &Path,
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<Embedding, EnrollmentError> {
        let region = FaceRegion::open(path).map_err(|source| EnrollmentError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        extractor.extract(&region).map_err(|e| match e {
            ExtractError::NoFaceDetected => EnrollmentError::NoFaceDetected,
            ExtractError::Backend(msg) => EnrollmentError::Extractor(msg),
        })
    }

    /// Enroll a new identity.
    ///
    /// Validate, compute the embedding, store the reference image, persist
    /// the identity, then add it to the gallery. Nothing is persisted unless
    /// every earlier step succeeded.
    pub fn enroll(
        &self,
        request: EnrollRequest,
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<Identity, EnrollmentError> {
        self.validate(&request)?;
        let id = request.id.trim().to_string();

        if self.ledger.contains(&id)? {
            return Err(EnrollmentError::DuplicateIdentity(id));
        }

        let embedding = self.embed_reference(&request.reference_image, extractor)?;
        self.write_gallery()?.check(&id, &embedding)?;

        let stored = self.images.store(&id, &request.reference_image)?;
        let identity = Identity {
            id,
            display_name: request.display_name.trim().to_string(),
            metadata: request.metadata,
            reference_image: stored,
            embedding,
            enrolled_at: Utc::now().to_rfc3339(),
        };

        let mut gallery = self.write_gallery()?;
        if let Err(e) = gallery
            .check(&identity.id, &identity.embedding)
            .map_err(EnrollmentError::from)
            .and_then(|()| self.ledger.enroll(&identity).map_err(EnrollmentError::from))
        {
            self.images.discard(&identity.reference_image);
            return Err(e);
        }
        gallery.add(&identity.id, identity.embedding.clone())?;
        drop(gallery);

        tracing::info!(id = %identity.id, name = %identity.display_name, "identity enrolled");
        Ok(identity)
    }

    /// Replace the reference image and embedding of an enrolled identity.
    pub fn reenroll(
        &self,
        identity_id: &str,
        reference_image: &Path,
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<Identity, EnrollmentError> {
        if reference_image.as_os_str().is_empty() {
            return Err(EnrollmentError::MissingField("reference_image".into()));
        }
        let previous = self
            .ledger
            .identity(identity_id)?
            .ok_or_else(|| EnrollmentError::UnknownIdentity(identity_id.to_string()))?;

        let embedding = self.embed_reference(reference_image, extractor)?;
        self.write_gallery()?.check(identity_id, &embedding)?;

        let stored = self.images.store(identity_id, reference_image)?;
        let identity = Identity {
            reference_image: stored,
            embedding,
            enrolled_at: Utc::now().to_rfc3339(),
            ..previous.clone()
        };

        let mut gallery = self.write_gallery()?;
        if let Err(e) = gallery
            .check(&identity.id, &identity.embedding)
            .map_err(EnrollmentError::from)
            .and_then(|()| self.ledger.reenroll(&identity).map_err(EnrollmentError::from))
        {
            self.images.discard(&identity.reference_image);
            return Err(e);
        }
        gallery.add(&identity.id, identity.embedding.clone())?;
        drop(gallery);

        if previous.reference_image != identity.reference_image
            && previous.reference_image.starts_with(&self.images.dir)
        {
            self.images.discard(&previous.reference_image);
        }

        tracing::info!(id = %identity.id, "identity re-enrolled");
        Ok(identity)
    }

    /// Recognize every face in one frame and record first sightings for `date`.
    pub fn recognize_frame(
        &self,
        frame: &Frame,
        pipeline: &mut dyn FacePipeline,
        date: NaiveDate,
    ) -> Result<Vec<RecognitionEvent>, EngineError> {
        let boxes = match pipeline.locate(&frame.data, frame.width, frame.height) {
            Ok(boxes) => boxes,
            Err(ExtractError::NoFaceDetected) => return Ok(Vec::new()),
            Err(ExtractError::Backend(msg)) => return Err(EngineError::Extractor(msg)),
        };

        let mut events = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let Some(region) = FaceRegion::crop(&frame.data, frame.width, frame.height, &bbox)
            else {
                tracing::debug!(?bbox, "face box outside frame; skipping");
                continue;
            };

            let embedding = match pipeline.extract(&region) {
                Ok(embedding) => embedding,
                Err(ExtractError::NoFaceDetected) => {
                    tracing::debug!(?bbox, "no face in region; skipping");
                    continue;
                }
                Err(ExtractError::Backend(msg)) => return Err(EngineError::Extractor(msg)),
            };

            let result = {
                let gallery = self.read_gallery()?;
                self.matcher.compare(&embedding, gallery.entries(), self.threshold)
            };

            let outcome = match result.identity_id {
                Some(identity_id) => {
                    let presence = self.ledger.record_presence(&identity_id, date)?;
                    RecognitionOutcome::Known {
                        identity_id,
                        display_name: presence.display_name,
                        distance: result.distance,
                        recorded: presence.recorded,
                    }
                }
                None => RecognitionOutcome::Unknown {
                    distance: result.distance,
                },
            };
            events.push(RecognitionEvent { bbox, outcome });
        }

        Ok(events)
    }

    /// Drive recognition until `stop` is raised or the source fails.
    ///
    /// The stop signal is checked before every frame, so a frame already in
    /// progress finishes its ledger writes before the loop returns.
    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        pipeline: &mut dyn FacePipeline,
        sink: &mut dyn RecognitionSink,
        stop: &watch::Receiver<bool>,
    ) -> Result<LoopSummary, EngineError> {
        let mut summary = LoopSummary::default();

        if self.warmup_frames > 0 {
            tracing::info!(count = self.warmup_frames, "discarding warmup frames");
        }
        for _ in 0..self.warmup_frames {
            if *stop.borrow() {
                return Ok(summary);
            }
            if let Err(e) = source.next_frame() {
                tracing::info!(error = %e, "frame source ended during warmup");
                summary.stopped_by = StopReason::CaptureEnded;
                return Ok(summary);
            }
        }

        loop {
            if *stop.borrow() {
                summary.stopped_by = StopReason::StopRequested;
                break;
            }

            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::info!(error = %e, "frame source ended");
                    summary.stopped_by = StopReason::CaptureEnded;
                    break;
                }
            };
            summary.frames += 1;

            if self.skip_dark_frames && frame.is_dark {
                summary.dark_frames += 1;
                tracing::debug!(seq = frame.sequence, luma = frame.mean_luma(), "skipping dark frame");
                continue;
            }

            let events = self.recognize_frame(&frame, pipeline, (self.today)())?;
            summary.faces += events.len();
            summary.recorded += events.iter().filter(|e| e.recorded()).count();
            sink.present(&frame, &events);
        }

        tracing::info!(
            frames = summary.frames,
            faces = summary.faces,
            recorded = summary.recorded,
            stopped_by = ?summary.stopped_by,
            "recognition loop finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use rollcall_core::MatchPolicy;
    use rollcall_hw::ReplaySource;
    use tempfile::TempDir;

    /// Embeds a region as `[mean / 100, 0]`; a black region holds no face.
    #[derive(Default)]
    struct FakePipeline {
        boxes: Vec<BoundingBox>,
        model_version: Option<String>,
        extract_calls: usize,
    }

    impl FaceLocator for FakePipeline {
        fn locate(&mut self, _gray: &[u8], _w: u32, _h: u32) -> Result<Vec<BoundingBox>, ExtractError> {
            Ok(self.boxes.clone())
        }
    }

    impl EmbeddingExtractor for FakePipeline {
        fn extract(&mut self, region: &FaceRegion) -> Result<Embedding, ExtractError> {
            self.extract_calls += 1;
            let pixels = region.pixels();
            let mean = pixels.iter().map(|&p| p as f32).sum::<f32>() / pixels.len() as f32;
            if mean == 0.0 {
                return Err(ExtractError::NoFaceDetected);
            }
            Ok(Embedding {
                values: vec![mean / 100.0, 0.0],
                model_version: self.model_version.clone(),
            })
        }

        fn model_version(&self) -> Option<&str> {
            self.model_version.as_deref()
        }
    }

    #[derive(Default)]
    struct CollectSink {
        events: Vec<RecognitionEvent>,
    }

    impl RecognitionSink for CollectSink {
        fn present(&mut self, _frame: &Frame, events: &[RecognitionEvent]) {
            self.events.extend_from_slice(events);
        }
    }

    struct Fixture {
        dir: TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::defaults(dir.path());
            config.warmup_frames = 0;
            Self { dir, config }
        }

        fn engine(&self) -> AttendanceEngine {
            let ledger = Arc::new(Ledger::open(&self.config.db_path).unwrap());
            AttendanceEngine::new(ledger, &self.config)
        }

        /// Write a uniform grayscale reference image.
        fn image(&self, name: &str, value: u8) -> PathBuf {
            let path = self.dir.path().join(name);
            GrayImage::from_pixel(4, 4, Luma([value])).save(&path).unwrap();
            path
        }

        fn request(&self, id: &str, value: u8) -> EnrollRequest {
            EnrollRequest {
                id: id.into(),
                display_name: format!("Student {id}"),
                metadata: BTreeMap::from([("course".to_string(), "CS101".to_string())]),
                reference_image: self.image(&format!("{id}-upload.png"), value),
            }
        }
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    /// 8x4 frame: left half `left`, right half `right`.
    fn split_frame(left: u8, right: u8) -> Frame {
        let mut data = Vec::with_capacity(32);
        for _ in 0..4 {
            data.extend([left; 4]);
            data.extend([right; 4]);
        }
        Frame::from_gray(data, 8, 4, 0)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_enroll_persists_and_updates_gallery() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();

        let identity = engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();

        assert_eq!(identity.embedding.values, vec![0.5, 0.0]);
        assert!(identity.reference_image.starts_with(&fx.config.image_dir));
        assert!(identity.reference_image.exists());
        assert_eq!(engine.ledger().identity("S1").unwrap(), Some(identity.clone()));
        assert_eq!(
            engine.gallery_snapshot().unwrap().get("S1"),
            Some(&identity.embedding)
        );
    }

    #[test]
    fn test_enroll_missing_display_name() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut request = fx.request("S1", 50);
        request.display_name = "  ".into();

        let err = engine.enroll(request, &mut FakePipeline::default()).unwrap_err();
        assert!(matches!(err, EnrollmentError::MissingField(f) if f == "display_name"));
        assert!(engine.ledger().list_identities().unwrap().is_empty());
        assert!(engine.gallery_snapshot().unwrap().is_empty());
        assert!(!fx.config.image_dir.exists());
    }

    #[test]
    fn test_enroll_missing_required_metadata() {
        let mut fx = Fixture::new();
        fx.config.required_metadata = vec!["cohort".into()];
        let engine = fx.engine();

        let err = engine
            .enroll(fx.request("S1", 50), &mut FakePipeline::default())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::MissingField(f) if f == "cohort"));
        assert!(!engine.ledger().contains("S1").unwrap());
    }

    #[test]
    fn test_enroll_duplicate_leaves_state_unchanged() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();
        let original = engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();
        let gallery_before = engine.gallery_snapshot().unwrap();

        let err = engine.enroll(fx.request("S1", 200), &mut pipeline).unwrap_err();
        assert!(matches!(err, EnrollmentError::DuplicateIdentity(id) if id == "S1"));

        assert_eq!(engine.ledger().list_identities().unwrap(), vec![original]);
        assert_eq!(engine.gallery_snapshot().unwrap().entries(), gallery_before.entries());
        let stored_images = std::fs::read_dir(&fx.config.image_dir).unwrap().count();
        assert_eq!(stored_images, 1);
    }

    #[test]
    fn test_enroll_rejects_image_without_face() {
        let fx = Fixture::new();
        let engine = fx.engine();

        let err = engine
            .enroll(fx.request("S1", 0), &mut FakePipeline::default())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::NoFaceDetected));
        assert!(!engine.ledger().contains("S1").unwrap());
        assert!(engine.gallery_snapshot().unwrap().is_empty());
        assert!(!fx.config.image_dir.exists());
    }

    #[test]
    fn test_enroll_unreadable_image() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut request = fx.request("S1", 50);
        request.reference_image = fx.dir.path().join("missing.png");

        let err = engine.enroll(request, &mut FakePipeline::default()).unwrap_err();
        assert!(matches!(err, EnrollmentError::Image { .. }));
        assert!(!engine.ledger().contains("S1").unwrap());
    }

    #[test]
    fn test_reenroll_replaces_embedding() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();
        let before = engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();

        let new_image = fx.image("S1-new.png", 80);
        let after = engine.reenroll("S1", &new_image, &mut pipeline).unwrap();

        assert_eq!(after.display_name, before.display_name);
        assert_eq!(after.embedding.values, vec![0.8, 0.0]);
        assert_eq!(engine.gallery_snapshot().unwrap().len(), 1);
        assert_eq!(engine.gallery_snapshot().unwrap().get("S1"), Some(&after.embedding));
        assert_eq!(engine.ledger().identity("S1").unwrap(), Some(after.clone()));
        assert!(!before.reference_image.exists());
        assert!(after.reference_image.exists());

        let err = engine.reenroll("S9", &new_image, &mut pipeline).unwrap_err();
        assert!(matches!(err, EnrollmentError::UnknownIdentity(_)));
    }

    #[test]
    fn test_recognize_records_once_per_day() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();
        engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();
        pipeline.boxes = vec![bbox(0.0, 0.0, 4.0, 4.0)];
        let frame = split_frame(50, 200);

        let first = engine.recognize_frame(&frame, &mut pipeline, date("2024-01-01")).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].label(), "S1");
        assert!(first[0].recorded());

        let again = engine.recognize_frame(&frame, &mut pipeline, date("2024-01-01")).unwrap();
        assert!(!again[0].recorded());
        assert_eq!(again[0].label(), "S1");

        let next_day = engine.recognize_frame(&frame, &mut pipeline, date("2024-01-02")).unwrap();
        assert!(next_day[0].recorded());

        assert_eq!(engine.ledger().attendance_for("S1").unwrap().len(), 2);
    }

    #[test]
    fn test_recognize_unknown_writes_nothing() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();
        engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();

        // Right half (200) embeds to [2.0, 0], 1.5 away from S1; left half is black.
        pipeline.boxes = vec![bbox(4.0, 0.0, 4.0, 4.0), bbox(0.0, 0.0, 4.0, 4.0)];
        let events = engine
            .recognize_frame(&split_frame(0, 200), &mut pipeline, date("2024-01-01"))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label(), "Unknown");
        match events[0].outcome {
            RecognitionOutcome::Unknown { distance } => assert!((distance - 1.5).abs() < 1e-4),
            ref other => panic!("unexpected outcome {other:?}"),
        }
        assert!(engine.ledger().attendance_on(date("2024-01-01")).unwrap().is_empty());
    }

    #[test]
    fn test_recognize_two_faces_in_frame() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();
        engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();
        engine.enroll(fx.request("S2", 200), &mut pipeline).unwrap();

        pipeline.boxes = vec![bbox(0.0, 0.0, 4.0, 4.0), bbox(4.0, 0.0, 4.0, 4.0)];
        let events = engine
            .recognize_frame(&split_frame(50, 200), &mut pipeline, date("2024-01-01"))
            .unwrap();

        let labels: Vec<_> = events.iter().map(|e| e.label()).collect();
        assert_eq!(labels, vec!["S1", "S2"]);
        assert!(events.iter().all(|e| e.recorded()));
    }

    #[test]
    fn test_bootstrap_matches_gallery_before_restart() {
        let fx = Fixture::new();
        let mut pipeline = FakePipeline::default();
        let before = {
            let engine = fx.engine();
            engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();
            engine.enroll(fx.request("S2", 200), &mut pipeline).unwrap();
            engine.gallery_snapshot().unwrap()
        };

        let engine = fx.engine();
        let report = engine.bootstrap(&mut pipeline).unwrap();
        assert_eq!(report.loaded, 2);
        assert!(report.skipped.is_empty());
        assert_eq!(engine.gallery_snapshot().unwrap().entries(), before.entries());
    }

    #[test]
    fn test_bootstrap_recomputes_on_model_change() {
        let fx = Fixture::new();
        let mut pipeline = FakePipeline {
            model_version: Some("v1".into()),
            ..Default::default()
        };
        let s1 = fx.engine().enroll(fx.request("S1", 50), &mut pipeline).unwrap();
        let s2 = fx.engine().enroll(fx.request("S2", 200), &mut pipeline).unwrap();

        // S2's stored image no longer holds a face; it can only be skipped on recompute.
        GrayImage::from_pixel(4, 4, Luma([0u8]))
            .save(&s2.reference_image)
            .unwrap();

        let mut upgraded = FakePipeline {
            model_version: Some("v2".into()),
            ..Default::default()
        };
        let engine = fx.engine();
        let report = engine.bootstrap(&mut upgraded).unwrap();

        assert_eq!(upgraded.extract_calls, 2);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped[0].identity_id, "S2");
        let gallery = engine.gallery_snapshot().unwrap();
        assert_eq!(gallery.get("S1").unwrap().values, s1.embedding.values);
        assert_eq!(gallery.get("S1").unwrap().model_version.as_deref(), Some("v2"));

        let stored = engine.ledger().identity("S1").unwrap().unwrap();
        assert_eq!(stored.embedding.model_version.as_deref(), Some("v2"));
        assert_eq!(
            engine.ledger().identity("S2").unwrap().unwrap().embedding.model_version.as_deref(),
            Some("v1")
        );

        // Later starts on the same model reuse the refreshed embeddings.
        let mut restarted = FakePipeline {
            model_version: Some("v2".into()),
            ..Default::default()
        };
        fx.engine().bootstrap(&mut restarted).unwrap();
        assert_eq!(restarted.extract_calls, 1);
    }

    #[test]
    fn test_bootstrap_reuses_stored_embeddings() {
        let fx = Fixture::new();
        let mut pipeline = FakePipeline::default();
        fx.engine().enroll(fx.request("S1", 50), &mut pipeline).unwrap();

        let mut fresh = FakePipeline::default();
        let engine = fx.engine();
        engine.bootstrap(&mut fresh).unwrap();
        assert_eq!(fresh.extract_calls, 0);
        assert_eq!(engine.gallery_snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_enrollment_during_recognition() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.enroll(fx.request("S1", 50), &mut FakePipeline::default()).unwrap();
        let s2 = fx.request("S2", 200);
        let retake = fx.image("S1-retake.png", 50);
        let day = date("2024-06-01");
        let both = vec![bbox(0.0, 0.0, 4.0, 4.0), bbox(4.0, 0.0, 4.0, 4.0)];

        let events: Vec<RecognitionEvent> = std::thread::scope(|scope| {
            let engine = &engine;
            scope.spawn(move || {
                let mut pipeline = FakePipeline::default();
                engine.enroll(s2, &mut pipeline).unwrap();
                engine.reenroll("S1", &retake, &mut pipeline).unwrap();
            });
            let recognizers: Vec<_> = (0..4)
                .map(|_| {
                    let boxes = both.clone();
                    scope.spawn(move || {
                        let mut pipeline = FakePipeline {
                            boxes,
                            ..Default::default()
                        };
                        let frame = split_frame(50, 200);
                        let mut seen = Vec::new();
                        for _ in 0..25 {
                            seen.extend(engine.recognize_frame(&frame, &mut pipeline, day).unwrap());
                        }
                        seen
                    })
                })
                .collect();
            recognizers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(events.len(), 200);
        for event in &events {
            match &event.outcome {
                RecognitionOutcome::Known {
                    identity_id,
                    display_name,
                    distance,
                    ..
                } => {
                    assert_eq!(display_name, &format!("Student {identity_id}"));
                    assert!(*distance <= 0.6);
                }
                RecognitionOutcome::Unknown { distance } => {
                    // Only the S2 half may be unknown, and only before S2 is enrolled.
                    assert_eq!(event.bbox.x, 4.0);
                    assert!((distance - 1.5).abs() < 1e-4);
                }
            }
        }

        let rows = engine.ledger().attendance_on(day).unwrap();
        for id in ["S1", "S2"] {
            let known = events.iter().filter(|e| e.label() == id).count();
            let recorded = events.iter().filter(|e| e.label() == id && e.recorded()).count();
            let stored = rows.iter().filter(|r| r.identity_id == id).count();
            assert_eq!(recorded, stored, "{id}");
            assert_eq!(stored, usize::from(known > 0), "{id}");
        }
        assert_eq!(events.iter().filter(|e| e.label() == "S1").count(), 100);

        let gallery = engine.gallery_snapshot().unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.get("S2").unwrap().values, vec![2.0, 0.0]);
    }

    #[test]
    fn test_first_match_policy() {
        let mut fx = Fixture::new();
        fx.config.match_policy = MatchPolicy::FirstUnderThreshold;
        fx.config.match_threshold = 0.6;
        let engine = fx.engine();
        let mut pipeline = FakePipeline::default();
        engine.enroll(fx.request("A", 100), &mut pipeline).unwrap();
        engine.enroll(fx.request("B", 140), &mut pipeline).unwrap();

        // A face at 140 is 0.4 from A and 0.0 from B.
        pipeline.boxes = vec![bbox(4.0, 0.0, 4.0, 4.0)];
        let events = engine
            .recognize_frame(&split_frame(0, 140), &mut pipeline, date("2024-01-01"))
            .unwrap();
        assert_eq!(events[0].label(), "A");
    }

    #[test]
    fn test_run_stops_when_source_ends() {
        let fx = Fixture::new();
        let engine = fx.engine().with_clock(|| NaiveDate::from_ymd_opt(2024, 5, 6).unwrap());
        let mut pipeline = FakePipeline::default();
        engine.enroll(fx.request("S1", 50), &mut pipeline).unwrap();
        pipeline.boxes = vec![bbox(0.0, 0.0, 4.0, 4.0)];

        let mut source = ReplaySource::new([
            split_frame(50, 50),
            Frame::from_gray(vec![0u8; 32], 8, 4, 1),
            split_frame(50, 50),
        ]);
        let mut sink = CollectSink::default();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let summary = engine.run(&mut source, &mut pipeline, &mut sink, &stop_rx).unwrap();

        assert_eq!(summary.stopped_by, StopReason::CaptureEnded);
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.dark_frames, 1);
        assert_eq!(summary.faces, 2);
        assert_eq!(summary.recorded, 1);
        assert_eq!(sink.events.len(), 2);
        let events = engine.ledger().attendance_on(date("2024-05-06")).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_run_honors_stop_signal() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut source = ReplaySource::new([split_frame(50, 50)]);
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let summary = engine
            .run(
                &mut source,
                &mut FakePipeline::default(),
                &mut CollectSink::default(),
                &stop_rx,
            )
            .unwrap();
        assert_eq!(summary.stopped_by, StopReason::StopRequested);
        assert_eq!(summary.frames, 0);
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_run_discards_warmup_frames() {
        let mut fx = Fixture::new();
        fx.config.warmup_frames = 2;
        let engine = fx.engine();
        let mut source = ReplaySource::new([
            split_frame(50, 50),
            split_frame(50, 50),
            split_frame(50, 50),
        ]);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let summary = engine
            .run(
                &mut source,
                &mut FakePipeline::default(),
                &mut CollectSink::default(),
                &stop_rx,
            )
            .unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.stopped_by, StopReason::CaptureEnded);
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("S-1_a"), "S-1_a");
        assert_eq!(file_safe("../etc/passwd"), "___etc_passwd");
    }
}
