// imgenie/crates/imgenie/src/coordinator.rs
//! Generation coordinator
//!
//! Order of a generation:
//! 1. lease the slot (`Busy` / `ModelNotLoaded` before anything else happens)
//! 2. validate and fill in defaults from the descriptor
//! 3. read and resize the reference or input image
//! 4. compose adapters (text-to-image with an adapter list)
//! 5. reset progress, run the backend, persist the artifact
//!
//! Whatever fails after the lease is taken, the slot keeps its model and the
//! adapter stack it had before the call.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::AdapterComposer;
use crate::backend::{InferenceJob, ProgressCallback};
use crate::error::{ImgenieError, Result};
use crate::imaging::{self, PreparedImage};
use crate::metrics;
use crate::output::ArtifactStore;
use crate::progress::ProgressTracker;
use crate::slot::{ModelSlot, SlotLease};
use crate::types::{
    ActiveAdapter, Artifact, FolderCaptionRequest, GenerationRequest, ImageToTextRequest, Modality,
    ModelDescriptor, ReferenceImage, TextToImageRequest, DEFAULT_CAPTION_INSTRUCTIONS, DEFAULT_NEGATIVE_PROMPT,
};

pub const MAX_STEPS: u32 = 200;
pub const MAX_TOKENS: u32 = 4096;
pub const MIN_DIMENSION: u32 = 16;
pub const MAX_DIMENSION: u32 = 2048;

/// The two slots, one per modality.
#[derive(Clone)]
pub struct SlotSet {
    text_to_image: Arc<ModelSlot>,
    image_to_text: Arc<ModelSlot>,
}

impl SlotSet {
    pub fn new(text_to_image: Arc<ModelSlot>, image_to_text: Arc<ModelSlot>) -> Self {
        Self { text_to_image, image_to_text }
    }

    pub fn get(&self, modality: Modality) -> &Arc<ModelSlot> {
        match modality {
            Modality::TextToImage => &self.text_to_image,
            Modality::ImageToText => &self.image_to_text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    pub request_id: Uuid,
    pub modality: Modality,
    pub model_id: String,
    #[serde(skip)]
    pub artifact: Artifact,
    pub saved_path: PathBuf,
    pub seed: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub adapters: Vec<ActiveAdapter>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptionedImage {
    pub image: PathBuf,
    pub caption_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedImage {
    pub image: PathBuf,
    pub error: String,
}

/// Result of captioning a folder. Per-image failures do not stop the batch.
#[derive(Debug, Clone, Serialize)]
pub struct FolderCaptionOutput {
    pub request_id: Uuid,
    pub model_id: String,
    pub folder: PathBuf,
    pub described: Vec<CaptionedImage>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<FailedImage>,
    pub elapsed: Duration,
}

pub struct GenerationCoordinator {
    slots: SlotSet,
    composer: AdapterComposer,
    progress: ProgressTracker,
    store: ArtifactStore,
    input_dir: PathBuf,
    reference_long_edge: u32,
}

/// Job plus the bits of it reported back to the caller.
struct PreparedJob {
    job: InferenceJob,
    label: String,
    seed: Option<u64>,
}

impl GenerationCoordinator {
    pub fn new(
        slots: SlotSet,
        progress: ProgressTracker,
        store: ArtifactStore,
        input_dir: PathBuf,
        reference_long_edge: u32,
    ) -> Self {
        Self {
            slots,
            composer: AdapterComposer::new(),
            progress,
            store,
            input_dir,
            reference_long_edge,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput> {
        let mut lease = self.slots.get(request.modality()).lease()?;
        let previous = lease.adapters().to_vec();

        let result = self.generate_leased(&mut lease, request).await;
        if result.is_err() && lease.adapters() != previous.as_slice() {
            self.composer.restore(&mut lease, previous).await;
        }
        result
    }

    async fn generate_leased(&self, lease: &mut SlotLease, request: GenerationRequest) -> Result<GenerationOutput> {
        let modality = lease.modality();
        let descriptor = lease.descriptor()?;

        let prepared = match request {
            GenerationRequest::TextToImage(req) => self.prepare_text_to_image(lease, req).await,
            GenerationRequest::ImageToText(req) => self.prepare_image_to_text(lease, req).await,
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("{} request rejected before generation: {}", modality, e);
                self.progress.reject(modality, e.to_string());
                metrics::inc_generation(modality.as_str(), "rejected");
                return Err(e);
            }
        };

        let request_id = self.progress.reset(modality, prepared.job.total_steps());
        info!(
            "Generating with {} {} ({} steps, request {})",
            modality,
            descriptor.id,
            prepared.job.total_steps(),
            request_id
        );
        let started = Instant::now();

        let handle = lease.handle()?;
        let result = lease
            .backend()
            .run(handle, &prepared.job, self.progress.callback(request_id))
            .await;

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(e) => {
                let err = ImgenieError::generation_failed(&e);
                error!("{} generation with {} failed: {:#}", modality, descriptor.id, e);
                self.progress.fail(request_id, err.to_string());
                metrics::inc_generation(modality.as_str(), "error");
                return Err(err);
            }
        };

        let saved_path = match self.store.save(&artifact, &prepared.label) {
            Ok(path) => path,
            Err(e) => {
                self.progress.fail(request_id, format!("Failed to save output: {}", e));
                metrics::inc_generation(modality.as_str(), "error");
                return Err(e);
            }
        };
        self.progress.complete(request_id);

        let elapsed = started.elapsed();
        metrics::inc_generation(modality.as_str(), "ok");
        metrics::observe_generation(modality.as_str(), elapsed.as_secs_f64());
        info!("✅ {} generation finished in {:.1}s", modality, elapsed.as_secs_f64());

        let (width, height) = match &artifact {
            Artifact::Image { width, height, .. } => (Some(*width), Some(*height)),
            Artifact::Text(_) => (None, None),
        };
        Ok(GenerationOutput {
            request_id,
            modality,
            model_id: descriptor.id.clone(),
            adapters: lease.adapters().to_vec(),
            artifact,
            saved_path,
            seed: prepared.seed,
            width,
            height,
            elapsed,
        })
    }

    async fn prepare_text_to_image(&self, lease: &mut SlotLease, req: TextToImageRequest) -> Result<PreparedJob> {
        let descriptor = lease.descriptor()?;

        let prompt = req.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(ImgenieError::InvalidRequest("prompt must not be empty".into()));
        }
        let steps = req.steps.unwrap_or(descriptor.default_steps);
        if steps == 0 || steps > MAX_STEPS {
            return Err(ImgenieError::InvalidRequest(format!(
                "steps must be between 1 and {}, got {}",
                MAX_STEPS, steps
            )));
        }
        let guidance_scale = req.guidance_scale.unwrap_or(descriptor.default_guidance_scale);
        if !guidance_scale.is_finite() || guidance_scale < 0.0 {
            return Err(ImgenieError::InvalidRequest(format!(
                "guidance_scale must be a non-negative number, got {}",
                guidance_scale
            )));
        }
        if !req.strength.is_finite() || !(0.0..=1.0).contains(&req.strength) {
            return Err(ImgenieError::InvalidRequest(format!(
                "strength must be within [0, 1], got {}",
                req.strength
            )));
        }
        let resolution = req
            .resolution
            .or_else(|| descriptor.resolution_options.first().copied())
            .unwrap_or_default();
        for (axis, value) in [("width", resolution.width), ("height", resolution.height)] {
            if value % imaging::DIMENSION_MULTIPLE != 0 || !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                return Err(ImgenieError::InvalidRequest(format!(
                    "{} {} must be a multiple of {} between {} and {}",
                    axis,
                    value,
                    imaging::DIMENSION_MULTIPLE,
                    MIN_DIMENSION,
                    MAX_DIMENSION
                )));
            }
        }

        let (mut width, mut height) = (resolution.width, resolution.height);
        let mut reference_png = None;
        if let Some(reference) = req.reference_image {
            if lease.backend().supports_reference_image() {
                let bytes = self.read_image(reference).await?;
                let long_edge = self.reference_long_edge;
                let prepared = run_blocking(move || imaging::prepare_reference(&bytes, long_edge)).await?;
                info!(
                    "Reference image mode: output {}x{} instead of {}",
                    prepared.width, prepared.height, resolution
                );
                width = prepared.width;
                height = prepared.height;
                reference_png = Some(prepared.png);
            } else {
                warn!(
                    "Backend for {} cannot condition on images; ignoring reference image",
                    descriptor.id
                );
            }
        }

        if let Some(adapters) = &req.adapters {
            self.composer.apply(lease, adapters).await?;
        }

        let seed = req.seed.unwrap_or_else(rand::random);
        let negative_prompt = req
            .negative_prompt
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string());

        Ok(PreparedJob {
            label: prompt.clone(),
            seed: Some(seed),
            job: InferenceJob::TextToImage {
                prompt,
                negative_prompt,
                steps,
                guidance_scale,
                width,
                height,
                strength: req.strength,
                seed,
                reference_png,
            },
        })
    }

    async fn prepare_image_to_text(&self, lease: &SlotLease, req: ImageToTextRequest) -> Result<PreparedJob> {
        let descriptor = lease.descriptor()?;
        let (instructions, max_tokens) = caption_settings(&descriptor, req.instructions, req.max_tokens)?;

        let bytes = self.read_image(req.image).await?;
        let PreparedImage { png, .. } = run_blocking(move || imaging::normalize(&bytes)).await?;

        Ok(PreparedJob {
            label: "caption".to_string(),
            seed: None,
            job: InferenceJob::ImageToText {
                image_png: png,
                instructions,
                max_tokens,
            },
        })
    }

    async fn read_image(&self, image: ReferenceImage) -> Result<Vec<u8>> {
        match image {
            ReferenceImage::Bytes(bytes) if bytes.is_empty() => {
                Err(ImgenieError::InvalidRequest("image payload is empty".into()))
            }
            ReferenceImage::Bytes(bytes) => Ok(bytes),
            ReferenceImage::Path(relative) => {
                let path = imaging::resolve_input_path(&self.input_dir, &relative)?;
                tokio::fs::read(&path).await.map_err(|e| {
                    ImgenieError::InvalidRequest(format!("cannot read image {}: {}", path.display(), e))
                })
            }
        }
    }

    /// Captions every image directly inside a folder of the input directory.
    /// The image-to-text slot stays leased for the whole batch; progress
    /// counts images.
    pub async fn describe_folder(&self, request: FolderCaptionRequest) -> Result<FolderCaptionOutput> {
        let modality = Modality::ImageToText;
        let lease = self.slots.get(modality).lease()?;
        let descriptor = lease.descriptor()?;

        let setup = match &request.folder {
            Some(relative) => imaging::resolve_input_path(&self.input_dir, relative),
            None => Ok(self.input_dir.clone()),
        }
        .and_then(|folder| {
            let settings = caption_settings(&descriptor, request.instructions.clone(), request.max_tokens)?;
            Ok((folder, settings))
        });
        let (folder, (instructions, max_tokens)) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                self.progress.reject(modality, e.to_string());
                return Err(e);
            }
        };
        let listing = {
            let folder = folder.clone();
            run_blocking(move || imaging::list_images(&folder)).await
        };
        let images = match listing {
            Ok(images) => images,
            Err(e) => {
                self.progress.reject(modality, e.to_string());
                return Err(e);
            }
        };

        let request_id = self.progress.reset(modality, images.len() as u32);
        info!(
            "Captioning {} image(s) in {} with {} (request {})",
            images.len(),
            folder.display(),
            descriptor.id,
            request_id
        );
        let started = Instant::now();

        let mut described = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();
        for (index, image) in images.into_iter().enumerate() {
            if request.skip_existing && ArtifactStore::caption_path(&image).exists() {
                skipped.push(image);
            } else {
                let outcome = match self.caption_file(&lease, &image, &instructions, max_tokens).await {
                    Ok(text) => self.store.write_caption(&image, &text),
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(caption_path) => {
                        metrics::inc_generation(modality.as_str(), "ok");
                        described.push(CaptionedImage { image, caption_path });
                    }
                    Err(e) => {
                        metrics::inc_generation(modality.as_str(), "error");
                        warn!("Captioning {} failed: {}", image.display(), e);
                        failed.push(FailedImage { image, error: e.to_string() });
                    }
                }
            }
            self.progress.update(request_id, index as u32 + 1);
        }
        self.progress.complete(request_id);

        let elapsed = started.elapsed();
        info!(
            "✅ Folder captioned in {:.1}s: {} described, {} skipped, {} failed",
            elapsed.as_secs_f64(),
            described.len(),
            skipped.len(),
            failed.len()
        );
        Ok(FolderCaptionOutput {
            request_id,
            model_id: descriptor.id.clone(),
            folder,
            described,
            skipped,
            failed,
            elapsed,
        })
    }

    async fn caption_file(
        &self,
        lease: &SlotLease,
        image: &Path,
        instructions: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let bytes = tokio::fs::read(image).await?;
        let PreparedImage { png, .. } = run_blocking(move || imaging::normalize(&bytes)).await?;
        let job = InferenceJob::ImageToText {
            image_png: png,
            instructions: instructions.to_string(),
            max_tokens,
        };
        let ignore_steps: ProgressCallback = Arc::new(|_step: u32| {});
        match lease.backend().run(lease.handle()?, &job, ignore_steps).await {
            Ok(Artifact::Text(text)) => Ok(text),
            Ok(Artifact::Image { .. }) => Err(ImgenieError::GenerationFailed(
                "captioning backend returned an image".into(),
            )),
            Err(e) => Err(ImgenieError::generation_failed(&e)),
        }
    }
}

/// Instructions and token budget for a caption, defaults filled in.
fn caption_settings(
    descriptor: &ModelDescriptor,
    instructions: Option<String>,
    max_tokens: Option<u32>,
) -> Result<(String, u32)> {
    let max_tokens = max_tokens.unwrap_or(descriptor.default_steps);
    if max_tokens == 0 || max_tokens > MAX_TOKENS {
        return Err(ImgenieError::InvalidRequest(format!(
            "max_tokens must be between 1 and {}, got {}",
            MAX_TOKENS, max_tokens
        )));
    }
    let instructions = instructions
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| DEFAULT_CAPTION_INSTRUCTIONS.to_string());
    Ok((instructions, max_tokens))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImgenieError::Internal(format!("image task panicked: {}", e)))?
}
