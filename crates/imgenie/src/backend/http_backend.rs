// imgenie/crates/imgenie/src/backend/http_backend.rs
//! Proxies model lifecycle and inference to a local worker process over HTTP.
//!
//! The worker owns the GPU; this side only speaks JSON to it. `/run` answers
//! with newline-delimited JSON events so progress arrives while the job runs.

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BackendHandle, BackendMetadata, InferenceBackend, InferenceJob, ProgressCallback};
use crate::types::{Artifact, Modality, ModelDescriptor};

#[derive(Debug, Serialize)]
struct LoadModelRequest<'a> {
    handle: Uuid,
    model_id: &'a str,
    model_path: &'a Path,
    modality: Modality,
}

#[derive(Debug, Serialize)]
struct HandleRequest {
    handle: Uuid,
}

#[derive(Debug, Serialize)]
struct LoadAdapterRequest<'a> {
    handle: Uuid,
    name: &'a str,
    path: &'a Path,
}

#[derive(Debug, Serialize)]
struct AdapterWeightsRequest<'a> {
    handle: Uuid,
    names: &'a [String],
    weights: &'a [f32],
}

#[derive(Debug, Serialize)]
#[serde(tag = "task", rename_all = "kebab-case")]
enum RunJob<'a> {
    TextToImage {
        prompt: &'a str,
        negative_prompt: &'a str,
        steps: u32,
        guidance_scale: f32,
        width: u32,
        height: u32,
        strength: f32,
        seed: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reference_image: Option<String>,
    },
    ImageToText {
        image: String,
        instructions: &'a str,
        max_tokens: u32,
    },
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    handle: Uuid,
    job: RunJob<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum RunEvent {
    Progress {
        step: u32,
    },
    Done {
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Error {
        message: String,
    },
}

pub struct HttpBackend {
    modality: Modality,
    base_url: String,
    http_client: reqwest::Client,
    load_timeout: Duration,
    generate_timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        modality: Modality,
        base_url: String,
        load_timeout: Duration,
        generate_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        info!("{} backend worker at {}", modality, base_url);
        Ok(Self {
            modality,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            load_timeout,
            generate_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http_client
            .post(self.url(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Backend request to {} failed: {}", path, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Backend {} returned {}: {}", path, status, body));
        }
        Ok(response)
    }

    fn wire_job(job: &InferenceJob) -> RunJob<'_> {
        match job {
            InferenceJob::TextToImage {
                prompt,
                negative_prompt,
                steps,
                guidance_scale,
                width,
                height,
                strength,
                seed,
                reference_png,
            } => RunJob::TextToImage {
                prompt,
                negative_prompt,
                steps: *steps,
                guidance_scale: *guidance_scale,
                width: *width,
                height: *height,
                strength: *strength,
                seed: *seed,
                reference_image: reference_png.as_ref().map(|png| BASE64_STANDARD.encode(png)),
            },
            InferenceJob::ImageToText { image_png, instructions, max_tokens } => RunJob::ImageToText {
                image: BASE64_STANDARD.encode(image_png),
                instructions,
                max_tokens: *max_tokens,
            },
        }
    }

    /// Interprets one event line. Returns the artifact once the worker is done.
    fn handle_event(
        line: &str,
        job: &InferenceJob,
        progress: &ProgressCallback,
    ) -> anyhow::Result<Option<Artifact>> {
        let event: RunEvent = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("Malformed event from backend ({}): {}", e, line))?;

        match event {
            RunEvent::Progress { step } => {
                progress(step);
                Ok(None)
            }
            RunEvent::Error { message } => Err(anyhow::anyhow!("Backend reported: {}", message)),
            RunEvent::Done { image, text } => match job {
                InferenceJob::TextToImage { width, height, .. } => {
                    let encoded = image.ok_or_else(|| anyhow::anyhow!("Backend finished without an image"))?;
                    let png = BASE64_STANDARD
                        .decode(encoded.trim())
                        .map_err(|e| anyhow::anyhow!("Backend image is not valid base64: {}", e))?;
                    Ok(Some(Artifact::Image { png, width: *width, height: *height }))
                }
                InferenceJob::ImageToText { .. } => {
                    let text = text.ok_or_else(|| anyhow::anyhow!("Backend finished without text"))?;
                    Ok(Some(Artifact::Text(text.trim().to_string())))
                }
            },
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<BackendHandle> {
        let handle = BackendHandle::new(descriptor.id.clone());
        info!("Requesting load of {} from {}", descriptor.id, self.base_url);
        let request = LoadModelRequest {
            handle: handle.id,
            model_id: &descriptor.id,
            model_path: &descriptor.model_path,
            modality: descriptor.modality,
        };
        self.post_json("/models/load", &request, self.load_timeout).await?;
        Ok(handle)
    }

    async fn unload(&self, handle: BackendHandle) -> anyhow::Result<()> {
        debug!("Requesting unload of {} ({})", handle.model_id, handle.id);
        self.post_json("/models/unload", &HandleRequest { handle: handle.id }, self.load_timeout)
            .await?;
        Ok(())
    }

    async fn load_adapter(&self, handle: &BackendHandle, name: &str, path: &Path) -> anyhow::Result<()> {
        let request = LoadAdapterRequest { handle: handle.id, name, path };
        self.post_json("/adapters/load", &request, self.load_timeout).await?;
        Ok(())
    }

    async fn set_adapter_weights(
        &self,
        handle: &BackendHandle,
        names: &[String],
        weights: &[f32],
    ) -> anyhow::Result<()> {
        let request = AdapterWeightsRequest { handle: handle.id, names, weights };
        self.post_json("/adapters/weights", &request, self.load_timeout).await?;
        Ok(())
    }

    async fn unload_adapters(&self, handle: &BackendHandle) -> anyhow::Result<()> {
        self.post_json("/adapters/unload", &HandleRequest { handle: handle.id }, self.load_timeout)
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        handle: &BackendHandle,
        job: &InferenceJob,
        progress: ProgressCallback,
    ) -> anyhow::Result<Artifact> {
        let request = RunRequest {
            handle: handle.id,
            job: Self::wire_job(job),
        };
        let response = self.post_json("/run", &request, self.generate_timeout).await?;

        let mut byte_stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(newline_pos + 1);
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(artifact) = Self::handle_event(line, job, &progress)? {
                    return Ok(artifact);
                }
            }
        }

        // Final event without a trailing newline.
        let rest = String::from_utf8_lossy(&buffer);
        let rest = rest.trim();
        if !rest.is_empty() {
            if let Some(artifact) = Self::handle_event(rest, job, &progress)? {
                return Ok(artifact);
            }
        }

        warn!("Backend stream for {} ended without a result", handle.model_id);
        Err(anyhow::anyhow!("Backend stream ended before the job finished"))
    }

    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            name: format!("http:{}", self.base_url),
            modality: self.modality,
            supports_reference_image: self.modality == Modality::TextToImage,
        }
    }
}
