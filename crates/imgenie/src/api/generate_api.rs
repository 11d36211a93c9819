//! Generation endpoint, folder captioning and progress polling.

use axum::{
    extract::{Multipart, Request, State},
    http::header,
    Json, RequestExt,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::{parse_task, run_detached, ApiError, ApiResult};
use crate::coordinator::{CaptionedImage, FailedImage};
use crate::imaging;
use crate::metrics;
use crate::progress::GenerationProgress;
use crate::shared_state::UnifiedAppState;
use crate::types::{
    ActiveAdapter, AdapterSpec, Artifact, FolderCaptionRequest, GenerationRequest, ImageToTextRequest, Modality,
    ReferenceImage, Resolution, TextToImageRequest,
};

#[derive(Debug, Default, Deserialize, Validate)]
pub struct GenerateRequest {
    pub task: Option<String>,
    #[serde(default)]
    pub prompt: String,
    pub negative_prompt: Option<String>,
    #[validate(range(min = 1, max = 200))]
    pub steps: Option<u32>,
    #[validate(range(min = 0.0, max = 50.0))]
    pub guidance_scale: Option<f32>,
    /// `"WxH"`.
    pub resolution: Option<String>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub strength: Option<f32>,
    pub seed: Option<u64>,
    #[serde(alias = "loras")]
    pub adapters: Option<Vec<AdapterSpec>>,
    /// Base64 or data URL.
    pub reference_image: Option<String>,
    /// Relative to the input directory.
    pub reference_image_path: Option<String>,
    /// Image to describe (image-to-text), base64 or data URL.
    pub image: Option<String>,
    pub image_path: Option<String>,
    pub instructions: Option<String>,
    #[validate(range(min = 1, max = 4096))]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub task: Modality,
    pub request_id: Uuid,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub saved_path: String,
    pub seed: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub adapters: Vec<ActiveAdapter>,
    pub elapsed_seconds: f64,
    /// Name of the uploaded file, for multipart requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

fn image_source(inline: Option<&str>, path: Option<&str>) -> Result<Option<ReferenceImage>, ApiError> {
    match (inline, path) {
        (Some(_), Some(_)) => Err(ApiError::bad_request(
            "give either an inline image or an image path, not both",
        )),
        (Some(data), None) => Ok(Some(ReferenceImage::Bytes(imaging::decode_base64_image(data)?))),
        (None, Some(path)) => Ok(Some(ReferenceImage::Path(PathBuf::from(path)))),
        (None, None) => Ok(None),
    }
}

impl GenerateRequest {
    /// Converts the wire body into a core request for `modality`.
    pub fn into_core(self, modality: Modality) -> Result<GenerationRequest, ApiError> {
        match modality {
            Modality::TextToImage => {
                let resolution = self
                    .resolution
                    .as_deref()
                    .map(str::parse::<Resolution>)
                    .transpose()
                    .map_err(ApiError::bad_request)?;
                let reference_image =
                    image_source(self.reference_image.as_deref(), self.reference_image_path.as_deref())?;
                let defaults = TextToImageRequest::new(self.prompt);
                Ok(GenerationRequest::TextToImage(TextToImageRequest {
                    negative_prompt: self.negative_prompt,
                    steps: self.steps,
                    guidance_scale: self.guidance_scale,
                    resolution,
                    strength: self.strength.unwrap_or(defaults.strength),
                    seed: self.seed,
                    adapters: self.adapters,
                    reference_image,
                    ..defaults
                }))
            }
            Modality::ImageToText => {
                let image = image_source(self.image.as_deref(), self.image_path.as_deref())?
                    .ok_or_else(|| ApiError::bad_request("image-to-text requires an image"))?;
                Ok(GenerationRequest::ImageToText(ImageToTextRequest {
                    image,
                    instructions: self.instructions.or(Some(self.prompt).filter(|p| !p.trim().is_empty())),
                    max_tokens: self.max_tokens,
                }))
            }
        }
    }
}

/// Accepts a JSON body, or a `multipart/form-data` upload with an `image`
/// file field for image-to-text.
pub async fn generate(State(state): State<UnifiedAppState>, request: Request) -> ApiResult<GenerateResponse> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);
    let parsed = if is_multipart {
        from_multipart(request).await
    } else {
        from_json(request).await.map(|request| (request, None))
    };
    let (request, filename) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            metrics::inc_request("/api/generate", e.status.as_str());
            return Err(e);
        }
    };
    let modality = request.modality();
    info!("Generate request for {}", modality);

    let shared = state.shared_state.clone();
    let output = run_detached("/api/generate", async move { shared.generate(request).await }).await?;

    let (image, description) = match &output.artifact {
        Artifact::Image { png, .. } => (Some(imaging::png_data_url(png)), None),
        Artifact::Text(text) => (None, Some(text.clone())),
    };
    Ok(Json(GenerateResponse {
        success: true,
        task: output.modality,
        request_id: output.request_id,
        model_id: output.model_id,
        image,
        description,
        saved_path: output.saved_path.display().to_string(),
        seed: output.seed,
        width: output.width,
        height: output.height,
        adapters: output.adapters,
        elapsed_seconds: output.elapsed.as_secs_f64(),
        filename,
    }))
}

async fn from_json(request: Request) -> Result<GenerationRequest, ApiError> {
    let Json(req) = request
        .extract::<Json<GenerateRequest>, _>()
        .await
        .map_err(|rejection| ApiError {
            status: rejection.status(),
            ..ApiError::bad_request(rejection.body_text())
        })?;
    req.validate().map_err(|e| ApiError::bad_request(e.to_string()))?;
    let modality = parse_task(req.task.as_deref())?;
    req.into_core(modality)
}

async fn from_multipart(request: Request) -> Result<(GenerationRequest, Option<String>), ApiError> {
    let mut form = request
        .extract::<Multipart, _>()
        .await
        .map_err(|rejection| ApiError {
            status: rejection.status(),
            ..ApiError::bad_request(rejection.body_text())
        })?;

    let mut upload = None;
    let mut task = None;
    let mut instructions = None;
    let mut max_tokens = None;
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let filename = field.file_name().unwrap_or_default().to_string();
            if filename.is_empty() {
                return Err(ApiError::bad_request("No file selected"));
            }
            if !imaging::has_extension(Path::new(&filename), &imaging::UPLOAD_EXTENSIONS) {
                return Err(ApiError::bad_request("Invalid file type"));
            }
            let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(e.body_text()))?;
            upload = Some((filename, bytes.to_vec()));
            continue;
        }
        let value = field.text().await.map_err(|e| ApiError::bad_request(e.body_text()))?;
        match name.as_str() {
            "task" => task = Some(value),
            "instructions" => instructions = Some(value),
            "prompt" if instructions.is_none() => instructions = Some(value),
            "max_tokens" => {
                let parsed = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| ApiError::bad_request(format!("max_tokens: {}", e)))?;
                max_tokens = Some(parsed);
            }
            _ => {}
        }
    }

    let modality = match task.as_deref() {
        None => Modality::ImageToText,
        Some(t) => parse_task(Some(t))?,
    };
    if modality != Modality::ImageToText {
        return Err(ApiError::bad_request("file uploads are only accepted for image-to-text"));
    }
    let (filename, bytes) = upload.ok_or_else(|| ApiError::bad_request("No image file"))?;
    let request = GenerationRequest::ImageToText(ImageToTextRequest {
        image: ReferenceImage::Bytes(bytes),
        instructions: instructions.filter(|i| !i.trim().is_empty()),
        max_tokens,
    });
    Ok((request, Some(filename)))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct DescribeFolderRequest {
    /// Relative to the input directory; omitted means the input directory.
    pub folder: Option<String>,
    pub instructions: Option<String>,
    #[validate(range(min = 1, max = 4096))]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub skip_existing: bool,
}

#[derive(Debug, Serialize)]
pub struct DescribeFolderResponse {
    pub success: bool,
    pub request_id: Uuid,
    pub model_id: String,
    pub folder: String,
    pub described: Vec<CaptionedImage>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<FailedImage>,
    pub elapsed_seconds: f64,
}

pub async fn describe_folder(
    State(state): State<UnifiedAppState>,
    Json(req): Json<DescribeFolderRequest>,
) -> ApiResult<DescribeFolderResponse> {
    if let Err(e) = req.validate() {
        metrics::inc_request("/api/describe-folder", "400");
        return Err(ApiError::bad_request(e.to_string()));
    }
    let request = FolderCaptionRequest {
        folder: req.folder.filter(|f| !f.trim().is_empty()).map(PathBuf::from),
        instructions: req.instructions,
        max_tokens: req.max_tokens,
        skip_existing: req.skip_existing,
    };
    info!("Describe-folder request for {:?}", request.folder);

    let shared = state.shared_state.clone();
    let output = run_detached("/api/describe-folder", async move { shared.describe_folder(request).await }).await?;

    Ok(Json(DescribeFolderResponse {
        success: true,
        request_id: output.request_id,
        model_id: output.model_id,
        folder: output.folder.display().to_string(),
        described: output.described,
        skipped: output.skipped,
        failed: output.failed,
        elapsed_seconds: output.elapsed.as_secs_f64(),
    }))
}

pub async fn progress(State(state): State<UnifiedAppState>) -> Json<GenerationProgress> {
    Json(state.shared_state.progress())
}
