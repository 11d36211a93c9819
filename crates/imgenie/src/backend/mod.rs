// imgenie/crates/imgenie/src/backend/mod.rs
//! Inference backends
//!
//! A backend is the opaque, long-running capability that actually holds model
//! weights and runs inference. The control plane only ever talks to it through
//! [`InferenceBackend`]; slots own the handles it hands out.

pub mod http_backend;
pub mod simulated;

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::types::{Artifact, Modality, ModelDescriptor};

pub use http_backend::HttpBackend;
pub use simulated::{SimulatedBackend, SimulatedOp};

/// Opaque reference to a model resident in a backend. Owned by exactly one
/// slot; `unload` consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct BackendHandle {
    pub id: Uuid,
    pub model_id: String,
}

impl BackendHandle {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.into(),
        }
    }
}

/// Invoked by the backend once per completed unit of work with the step count.
pub type ProgressCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Fully resolved work item. Every default has been filled in by the
/// coordinator; backends never consult the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceJob {
    TextToImage {
        prompt: String,
        negative_prompt: String,
        steps: u32,
        guidance_scale: f32,
        width: u32,
        height: u32,
        strength: f32,
        seed: u64,
        /// PNG of the already resized reference image.
        reference_png: Option<Vec<u8>>,
    },
    ImageToText {
        image_png: Vec<u8>,
        instructions: String,
        max_tokens: u32,
    },
}

impl InferenceJob {
    pub fn modality(&self) -> Modality {
        match self {
            InferenceJob::TextToImage { .. } => Modality::TextToImage,
            InferenceJob::ImageToText { .. } => Modality::ImageToText,
        }
    }

    /// Units of work the progress callback counts towards.
    pub fn total_steps(&self) -> u32 {
        match self {
            InferenceJob::TextToImage { steps, .. } => *steps,
            InferenceJob::ImageToText { max_tokens, .. } => *max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendMetadata {
    pub name: String,
    pub modality: Modality,
    pub supports_reference_image: bool,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<BackendHandle>;

    async fn unload(&self, handle: BackendHandle) -> anyhow::Result<()>;

    /// Attaches the adapter file at `path` under the synthetic `name`.
    async fn load_adapter(&self, handle: &BackendHandle, name: &str, path: &Path) -> anyhow::Result<()>;

    /// Weights are positional: `weights[i]` applies to `names[i]`.
    async fn set_adapter_weights(
        &self,
        handle: &BackendHandle,
        names: &[String],
        weights: &[f32],
    ) -> anyhow::Result<()>;

    async fn unload_adapters(&self, handle: &BackendHandle) -> anyhow::Result<()>;

    async fn run(
        &self,
        handle: &BackendHandle,
        job: &InferenceJob,
        progress: ProgressCallback,
    ) -> anyhow::Result<Artifact>;

    fn metadata(&self) -> BackendMetadata;

    fn supports_reference_image(&self) -> bool {
        self.metadata().supports_reference_image
    }
}

/// Builds the backend serving `modality` according to the configured kind.
pub fn create_backend(config: &Config, modality: Modality) -> anyhow::Result<Arc<dyn InferenceBackend>> {
    let backend: Arc<dyn InferenceBackend> = match config.backend {
        BackendKind::Http => Arc::new(HttpBackend::new(
            modality,
            config.backend_url(modality).to_string(),
            std::time::Duration::from_secs(config.load_timeout_seconds),
            std::time::Duration::from_secs(config.generate_timeout_seconds),
        )?),
        BackendKind::Simulated => Arc::new(SimulatedBackend::new(
            modality,
            std::time::Duration::from_millis(config.simulated_step_millis),
        )),
    };
    Ok(backend)
}
