// imgenie/crates/imgenie/src/backend/simulated.rs
//! In-process backend that behaves like a real one without any weights:
//! handles and adapters are tracked, each step takes a configurable amount of
//! time, and the outputs are placeholder artifacts. Used for local
//! development and throughout the test suite.

use async_trait::async_trait;
use dashmap::DashMap;
use image::{DynamicImage, GenericImageView, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BackendHandle, BackendMetadata, InferenceBackend, InferenceJob, ProgressCallback};
use crate::imaging;
use crate::types::{Artifact, Modality, ModelDescriptor};

/// Operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    Load,
    Unload,
    LoadAdapter,
    SetAdapterWeights,
    UnloadAdapters,
    Run,
}

#[derive(Debug, Clone, Default)]
struct Resident {
    model_id: String,
    adapters: Vec<(String, PathBuf)>,
    weights: Vec<(String, f32)>,
}

pub struct SimulatedBackend {
    modality: Modality,
    step_delay: Duration,
    resident: DashMap<Uuid, Resident>,
    failures: DashMap<SimulatedOp, String>,
    calls: DashMap<SimulatedOp, AtomicUsize>,
}

impl SimulatedBackend {
    pub fn new(modality: Modality, step_delay: Duration) -> Self {
        info!("Simulated {} backend ready ({}ms per step)", modality, step_delay.as_millis());
        Self {
            modality,
            step_delay,
            resident: DashMap::new(),
            failures: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Makes the next call of `op` fail with `message`.
    pub fn inject_failure(&self, op: SimulatedOp, message: impl Into<String>) {
        self.failures.insert(op, message.into());
    }

    /// How many times `op` has been invoked, failed calls included.
    pub fn calls(&self, op: SimulatedOp) -> usize {
        self.calls.get(&op).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn resident_models(&self) -> Vec<String> {
        self.resident.iter().map(|r| r.model_id.clone()).collect()
    }

    /// `(name, path)` of adapters attached to `handle`, in load order.
    pub fn adapters_on(&self, handle_id: Uuid) -> Vec<(String, PathBuf)> {
        self.resident
            .get(&handle_id)
            .map(|r| r.adapters.clone())
            .unwrap_or_default()
    }

    pub fn weights_on(&self, handle_id: Uuid) -> Vec<(String, f32)> {
        self.resident
            .get(&handle_id)
            .map(|r| r.weights.clone())
            .unwrap_or_default()
    }

    fn enter(&self, op: SimulatedOp) -> anyhow::Result<()> {
        self.calls
            .entry(op)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst);
        match self.failures.remove(&op) {
            Some((_, message)) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }

    fn with_resident<T>(&self, handle: &BackendHandle, f: impl FnOnce(&mut Resident) -> T) -> anyhow::Result<T> {
        let mut entry = self
            .resident
            .get_mut(&handle.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown handle {} for model {}", handle.id, handle.model_id))?;
        Ok(f(entry.value_mut()))
    }

    async fn tick(&self, step: u32, progress: &ProgressCallback) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        progress(step);
    }

    fn render(width: u32, height: u32, seed: u64) -> anyhow::Result<Vec<u8>> {
        let tint = (seed % 256) as u8;
        let img = RgbImage::from_fn(width, height, |x, y| {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            image::Rgb([r, g, tint])
        });
        imaging::encode_png(&DynamicImage::ImageRgb8(img))
    }

    fn caption(image_png: &[u8], instructions: &str) -> anyhow::Result<String> {
        let img = image::load_from_memory(image_png)
            .map_err(|e| anyhow::anyhow!("Failed to decode input image: {}", e))?;
        let (width, height) = img.dimensions();
        let orientation = match width.cmp(&height) {
            std::cmp::Ordering::Greater => "landscape",
            std::cmp::Ordering::Less => "portrait",
            std::cmp::Ordering::Equal => "square",
        };
        Ok(format!(
            "A {} image of {} by {} pixels, described in response to: {}",
            orientation, width, height, instructions
        ))
    }
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    async fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<BackendHandle> {
        self.enter(SimulatedOp::Load)?;
        tokio::time::sleep(self.step_delay).await;
        let handle = BackendHandle::new(descriptor.id.clone());
        self.resident.insert(
            handle.id,
            Resident {
                model_id: descriptor.id.clone(),
                ..Default::default()
            },
        );
        debug!("Simulated load of {} as {}", descriptor.id, handle.id);
        Ok(handle)
    }

    async fn unload(&self, handle: BackendHandle) -> anyhow::Result<()> {
        self.enter(SimulatedOp::Unload)?;
        tokio::time::sleep(self.step_delay).await;
        self.resident
            .remove(&handle.id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("Unknown handle {} for model {}", handle.id, handle.model_id))
    }

    async fn load_adapter(&self, handle: &BackendHandle, name: &str, path: &Path) -> anyhow::Result<()> {
        self.enter(SimulatedOp::LoadAdapter)?;
        if !path.is_file() {
            return Err(anyhow::anyhow!("Adapter file {} does not exist", path.display()));
        }
        self.with_resident(handle, |r| r.adapters.push((name.to_string(), path.to_path_buf())))
    }

    async fn set_adapter_weights(
        &self,
        handle: &BackendHandle,
        names: &[String],
        weights: &[f32],
    ) -> anyhow::Result<()> {
        self.enter(SimulatedOp::SetAdapterWeights)?;
        if names.len() != weights.len() {
            return Err(anyhow::anyhow!(
                "{} adapter names but {} weights",
                names.len(),
                weights.len()
            ));
        }
        self.with_resident(handle, |r| {
            r.weights = names.iter().cloned().zip(weights.iter().copied()).collect();
        })
    }

    async fn unload_adapters(&self, handle: &BackendHandle) -> anyhow::Result<()> {
        self.enter(SimulatedOp::UnloadAdapters)?;
        self.with_resident(handle, |r| {
            r.adapters.clear();
            r.weights.clear();
        })
    }

    async fn run(
        &self,
        handle: &BackendHandle,
        job: &InferenceJob,
        progress: ProgressCallback,
    ) -> anyhow::Result<Artifact> {
        self.with_resident(handle, |_| ())?;
        self.enter(SimulatedOp::Run)?;

        match job {
            InferenceJob::TextToImage { steps, width, height, seed, .. } => {
                for step in 1..=*steps {
                    self.tick(step, &progress).await;
                }
                let png = Self::render(*width, *height, *seed)?;
                Ok(Artifact::Image { png, width: *width, height: *height })
            }
            InferenceJob::ImageToText { image_png, instructions, max_tokens } => {
                let caption = Self::caption(image_png, instructions)?;
                let words: Vec<&str> = caption.split_whitespace().collect();
                let emitted = (words.len() as u32).min(*max_tokens);
                for step in 1..=emitted {
                    self.tick(step, &progress).await;
                }
                Ok(Artifact::Text(words[..emitted as usize].join(" ")))
            }
        }
    }

    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            name: "simulated".to_string(),
            modality: self.modality,
            supports_reference_image: self.modality == Modality::TextToImage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;
    use std::sync::{Arc, Mutex};

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            modality: Modality::TextToImage,
            name: id.to_string(),
            description: String::new(),
            model_path: PathBuf::from("/models").join(id),
            adapter_roots: vec![],
            resolution_options: vec![Resolution::default()],
            default_steps: 4,
            default_guidance_scale: 0.0,
        }
    }

    fn t2i_job(steps: u32) -> InferenceJob {
        InferenceJob::TextToImage {
            prompt: "a lighthouse".into(),
            negative_prompt: String::new(),
            steps,
            guidance_scale: 0.0,
            width: 64,
            height: 32,
            strength: 0.8,
            seed: 3,
            reference_png: None,
        }
    }

    #[tokio::test]
    async fn test_load_run_unload() {
        let backend = SimulatedBackend::new(Modality::TextToImage, Duration::ZERO);
        let handle = backend.load(&descriptor("turbo")).await.unwrap();
        assert_eq!(backend.resident_count(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |step| sink.lock().unwrap().push(step));

        let artifact = backend.run(&handle, &t2i_job(4), progress).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        match artifact {
            Artifact::Image { png, width, height } => {
                assert_eq!((width, height), (64, 32));
                assert_eq!(imaging::decode(&png).unwrap().dimensions(), (64, 32));
            }
            other => panic!("expected image, got {:?}", other),
        }

        backend.unload(handle).await.unwrap();
        assert_eq!(backend.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let backend = SimulatedBackend::new(Modality::TextToImage, Duration::ZERO);
        backend.inject_failure(SimulatedOp::Load, "CUDA out of memory");

        let err = backend.load(&descriptor("turbo")).await.unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
        assert_eq!(backend.resident_count(), 0);

        backend.load(&descriptor("turbo")).await.unwrap();
        assert_eq!(backend.calls(SimulatedOp::Load), 2);
    }

    #[tokio::test]
    async fn test_adapters_tracked_per_handle() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("anna.safetensors");
        std::fs::write(&file, b"weights").unwrap();

        let backend = SimulatedBackend::new(Modality::TextToImage, Duration::ZERO);
        let handle = backend.load(&descriptor("turbo")).await.unwrap();
        backend.load_adapter(&handle, "adapter_0", &file).await.unwrap();
        backend
            .set_adapter_weights(&handle, &["adapter_0".to_string()], &[1.0])
            .await
            .unwrap();
        assert_eq!(backend.adapters_on(handle.id), vec![("adapter_0".to_string(), file.clone())]);
        assert_eq!(backend.weights_on(handle.id), vec![("adapter_0".to_string(), 1.0)]);

        assert!(backend
            .load_adapter(&handle, "adapter_1", &dir.path().join("missing.safetensors"))
            .await
            .is_err());

        backend.unload_adapters(&handle).await.unwrap();
        assert!(backend.adapters_on(handle.id).is_empty());
    }

    #[tokio::test]
    async fn test_caption_respects_token_budget() {
        let backend = SimulatedBackend::new(Modality::ImageToText, Duration::ZERO);
        let handle = backend.load(&descriptor("captioner")).await.unwrap();
        let png = SimulatedBackend::render(40, 20, 0).unwrap();
        let job = InferenceJob::ImageToText {
            image_png: png,
            instructions: "describe".into(),
            max_tokens: 3,
        };
        let artifact = backend.run(&handle, &job, Arc::new(|_| {})).await.unwrap();
        assert_eq!(artifact, Artifact::Text("A landscape image".to_string()));
        assert!(!backend.supports_reference_image());
    }
}
