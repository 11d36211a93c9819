//! Shared application state
//!
//! Everything the API handlers need lives in one [`SharedState`] built at
//! startup and handed to the router behind an `Arc`. There are no globals
//! besides the prometheus registry.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::backend::{self, InferenceBackend};
use crate::config::{Catalog, Config};
use crate::coordinator::{FolderCaptionOutput, GenerationCoordinator, GenerationOutput, SlotSet};
use crate::error::Result;
use crate::output::ArtifactStore;
use crate::progress::{GenerationProgress, ProgressTracker};
use crate::registry::ModelRegistry;
use crate::slot::{ModelSlot, SlotStatus};
use crate::types::{FolderCaptionRequest, GenerationRequest, Modality};

pub struct SharedState {
    /// Configuration (read-only after initialization)
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<ModelRegistry>,
    pub slots: SlotSet,
    pub coordinator: Arc<GenerationCoordinator>,
    pub progress: ProgressTracker,
    pub started_at: Instant,
}

impl SharedState {
    /// Builds the state with the backends selected by `config`.
    pub fn new(config: Config, catalog: Catalog) -> anyhow::Result<Self> {
        let t2i = backend::create_backend(&config, Modality::TextToImage)?;
        let i2t = backend::create_backend(&config, Modality::ImageToText)?;
        Ok(Self::with_backends(config, catalog, t2i, i2t)?)
    }

    pub fn with_backends(
        config: Config,
        catalog: Catalog,
        text_to_image: Arc<dyn InferenceBackend>,
        image_to_text: Arc<dyn InferenceBackend>,
    ) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::from_catalog(&catalog)?);
        let slots = SlotSet::new(
            Arc::new(ModelSlot::new(Modality::TextToImage, text_to_image)),
            Arc::new(ModelSlot::new(Modality::ImageToText, image_to_text)),
        );
        let progress = ProgressTracker::new();
        let coordinator = Arc::new(GenerationCoordinator::new(
            slots.clone(),
            progress.clone(),
            ArtifactStore::new(catalog.output_dir.clone()),
            catalog.input_dir.clone(),
            config.reference_long_edge,
        ));
        info!("Shared state initialized with {} catalog models", registry.len());

        Ok(Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            registry,
            slots,
            coordinator,
            progress,
            started_at: Instant::now(),
        })
    }

    pub async fn load_model(&self, modality: Modality, model_id: &str) -> Result<SlotStatus> {
        let descriptor = self.registry.resolve(modality, model_id)?;
        let slot = self.slots.get(modality);
        slot.load(descriptor).await?;
        Ok(slot.status())
    }

    pub async fn unload_model(&self, modality: Modality) -> Result<SlotStatus> {
        let slot = self.slots.get(modality);
        slot.unload().await?;
        Ok(slot.status())
    }

    pub fn slot_status(&self, modality: Modality) -> SlotStatus {
        self.slots.get(modality).status()
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput> {
        self.coordinator.generate(request).await
    }

    pub async fn describe_folder(&self, request: FolderCaptionRequest) -> Result<FolderCaptionOutput> {
        self.coordinator.describe_folder(request).await
    }

    pub fn progress(&self) -> GenerationProgress {
        self.progress.get()
    }
}

/// State type used by the Axum router.
#[derive(Clone)]
pub struct UnifiedAppState {
    pub shared_state: Arc<SharedState>,
}

impl UnifiedAppState {
    pub fn new(shared_state: Arc<SharedState>) -> Self {
        Self { shared_state }
    }
}
