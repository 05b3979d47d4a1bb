use crate::api::{
    roster_students, EnrollResponse, ImageReport, RequestError, RosterEntry, VerifyRequest,
    VerifyResponse,
};
use crate::config::EngineConfig;
use crate::saga::{
    AssembleError, Assembler, OutcomeRecorder, PendingOutcome, RecordError, VerificationOutcome,
};
use rollcall_core::{
    match_faces, AnnotationRenderer, EmbeddingExtractor, EnrollmentBuilder, EuclideanMatcher,
    ExtractError, ImageInput, ImageMatches, RenderError, RosterIndex,
};
use rollcall_store::BlobStore;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a single image has no stored outcome.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error("image worker failed: {0}")]
    Worker(String),
    #[error("cancelled")]
    Cancelled,
}

/// Per-request result slots, one per input image, filled in any order.
pub struct ReportSlots {
    slots: Mutex<Vec<Option<ImageReport>>>,
}

impl ReportSlots {
    fn new(len: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; len]),
        }
    }

    fn put(&self, slot: usize, report: ImageReport) -> Result<(), RecordError> {
        let mut slots = self.slots.lock().map_err(|_| RecordError::Slot(slot))?;
        let entry = slots.get_mut(slot).ok_or(RecordError::Slot(slot))?;
        *entry = Some(report);
        Ok(())
    }

    fn fail(&self, slot: usize, file_name: &str, file_size: usize, err: &ImageError) {
        tracing::warn!(slot, image = %file_name, error = %err, "image failed");
        if self.put(slot, ImageReport::failed(file_name, file_size, err)).is_err() {
            tracing::error!(slot, image = %file_name, "result slot unavailable");
        }
    }

    /// Drain the slots in input order. Unfilled slots become failures.
    fn finish(&self, inputs: &[(String, usize)]) -> Vec<ImageReport> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        inputs
            .iter()
            .enumerate()
            .map(|(slot, (name, size))| {
                slots.get_mut(slot).and_then(Option::take).unwrap_or_else(|| {
                    ImageReport::failed(name.as_str(), *size, "no outcome recorded")
                })
            })
            .collect()
    }
}

impl OutcomeRecorder for ReportSlots {
    fn record(&self, slot: usize, outcome: &VerificationOutcome) -> Result<(), RecordError> {
        let report = ImageReport::succeeded(outcome);
        // The report must be emittable before the upload is committed.
        serde_json::to_value(&report)?;
        self.put(slot, report)
    }
}

/// Attendance verification and enrollment over a shared extractor and store.
///
/// Cheap to clone. The concurrency limit is shared by every clone, so it caps
/// images in flight across all concurrent requests.
#[derive(Clone)]
pub struct AttendanceEngine {
    config: EngineConfig,
    extractor: Arc<dyn EmbeddingExtractor>,
    renderer: AnnotationRenderer,
    assembler: Assembler,
    limiter: Arc<Semaphore>,
}

impl AttendanceEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn BlobStore>,
        extractor: Arc<dyn EmbeddingExtractor>,
    ) -> Self {
        let config = config.sanitized();
        let assembler = Assembler::new(store, config.store_timeout(), config.delete_attempts);
        Self {
            renderer: AnnotationRenderer::new(config.render_options()),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_images)),
            assembler,
            extractor,
            config,
        }
    }

    /// Build an engine whose store backend is selected by `config.store`.
    pub fn from_config(config: EngineConfig, extractor: Arc<dyn EmbeddingExtractor>) -> Self {
        let store = rollcall_store::open(&config.store);
        Self::new(config, store, extractor)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Verify a batch of classroom photos against the request's roster.
    ///
    /// Per-image failures are reported inside the response; only an empty
    /// batch or a malformed roster fails the whole request. Once `cancel`
    /// fires no further image starts, and the rest are reported cancelled.
    pub async fn verify(
        &self,
        request: VerifyRequest,
        cancel: &CancellationToken,
    ) -> Result<VerifyResponse, RequestError> {
        self.run_verify(request, cancel, |slots| slots as Arc<dyn OutcomeRecorder>).await
    }

    async fn run_verify<F>(
        &self,
        request: VerifyRequest,
        cancel: &CancellationToken,
        recorder_for: F,
    ) -> Result<VerifyResponse, RequestError>
    where
        F: FnOnce(Arc<ReportSlots>) -> Arc<dyn OutcomeRecorder>,
    {
        let VerifyRequest {
            images,
            roster,
            storage_path,
        } = request;

        if images.is_empty() {
            return Err(RequestError::NoImages);
        }
        let students = roster_students(&roster)?;
        let index = Arc::new(RosterIndex::build(&students));
        if index.is_empty() {
            tracing::info!("roster has no reference embeddings; every face will be unknown");
        }

        tracing::info!(
            images = images.len(),
            students = index.student_count(),
            embeddings = index.embedding_count(),
            path = %storage_path,
            "verification started"
        );

        let inputs: Vec<(String, usize)> =
            images.iter().map(|i| (i.file_name.clone(), i.bytes.len())).collect();
        let slots = Arc::new(ReportSlots::new(images.len()));
        let recorder = recorder_for(Arc::clone(&slots));
        let storage_path: Arc<str> = storage_path.into();

        let mut handles = Vec::with_capacity(images.len());
        for (slot, image) in images.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&self.limiter).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                slots.fail(slot, &image.file_name, image.bytes.len(), &ImageError::Cancelled);
                continue;
            };

            let job = ImageJob {
                slot,
                image,
                index: Arc::clone(&index),
                engine: self.clone(),
                storage_path: Arc::clone(&storage_path),
                recorder: Arc::clone(&recorder),
            };
            // Detached so a dropped request never abandons an upload mid-saga.
            let handle = tokio::spawn(async move {
                let _permit = permit;
                job.run().await
            });
            handles.push((slot, handle));
        }

        for (slot, handle) in handles {
            let (name, size) = &inputs[slot];
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => slots.fail(slot, name, *size, &err),
                Err(join) => slots.fail(slot, name, *size, &ImageError::Worker(join.to_string())),
            }
        }

        let results = slots.finish(&inputs);
        let failed = results.iter().filter(|r| r.is_failed()).count();
        tracing::info!(images = results.len(), failed, "verification finished");
        Ok(VerifyResponse { results })
    }

    /// Reference embeddings for a student's photos; photos without a face are omitted.
    pub async fn enroll(&self, images: Vec<ImageInput>) -> Result<EnrollResponse, RequestError> {
        if images.is_empty() {
            return Err(RequestError::NoImages);
        }
        let extractor = Arc::clone(&self.extractor);
        let embeddings = tokio::task::spawn_blocking(move || {
            EnrollmentBuilder::new(extractor.as_ref()).build(&images)
        })
        .await
        .map_err(|e| RequestError::Worker(e.to_string()))?;
        tracing::info!(embeddings = embeddings.len(), "enrollment finished");
        Ok(EnrollResponse { embeddings })
    }

    /// Build roster entries for many students at once, in the given order.
    pub async fn build_roster(
        &self,
        students: Vec<(String, Vec<ImageInput>)>,
    ) -> Result<Vec<RosterEntry>, RequestError> {
        let extractor = Arc::clone(&self.extractor);
        tokio::task::spawn_blocking(move || {
            let builder = EnrollmentBuilder::new(extractor.as_ref());
            students
                .into_iter()
                .map(|(id, images)| {
                    let embeddings = builder.build(&images);
                    if embeddings.is_empty() {
                        tracing::warn!(student = %id, "no usable photo; student will never match");
                    }
                    RosterEntry { id, embeddings }
                })
                .collect()
        })
        .await
        .map_err(|e| RequestError::Worker(e.to_string()))
    }
}

/// Everything one image needs, moved onto its own task.
struct ImageJob {
    slot: usize,
    image: ImageInput,
    index: Arc<RosterIndex>,
    engine: AttendanceEngine,
    storage_path: Arc<str>,
    recorder: Arc<dyn OutcomeRecorder>,
}

impl ImageJob {
    async fn run(self) -> Result<VerificationOutcome, ImageError> {
        let ImageJob {
            slot,
            image,
            index,
            engine,
            storage_path,
            recorder,
        } = self;

        let image_identifier = image.file_name.clone();
        let extractor = Arc::clone(&engine.extractor);
        let renderer = engine.renderer.clone();
        let threshold = engine.config.match_threshold;

        let (matches, rendered) = tokio::task::spawn_blocking(move || {
            analyze(&image, extractor.as_ref(), &index, threshold, &renderer)
        })
        .await
        .map_err(|e| ImageError::Worker(e.to_string()))??;

        tracing::debug!(
            slot,
            image = %image_identifier,
            faces = matches.results.len(),
            bytes = rendered.len(),
            "image annotated"
        );

        let upload_name = format!("{slot}-{}.jpg", Uuid::new_v4());
        let pending = PendingOutcome {
            slot,
            image_identifier,
            matched_ids: matches.matched_ids(),
            rendered,
            warnings: matches.warnings,
        };
        Ok(engine
            .assembler
            .assemble(pending, &storage_path, &upload_name, recorder.as_ref())
            .await?)
    }
}

/// Decode, extract, match and render one image.
fn analyze(
    image: &ImageInput,
    extractor: &dyn EmbeddingExtractor,
    index: &RosterIndex,
    threshold: f32,
    renderer: &AnnotationRenderer,
) -> Result<(ImageMatches, Vec<u8>), ImageError> {
    let decoded = image::load_from_memory(&image.bytes)?;
    let observations = extractor.extract_embeddings(image)?;
    let matches = match_faces(&EuclideanMatcher, observations, index, threshold);
    let rendered = renderer.render(&decoded, &matches.results)?;
    Ok((matches, rendered))
}
