//! Shared data model: modalities, model descriptors, adapters and requests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Task class a model serves. Each modality owns exactly one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    #[serde(rename = "text-to-image")]
    TextToImage,
    #[serde(rename = "image-to-text")]
    ImageToText,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::TextToImage, Modality::ImageToText];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::TextToImage => "text-to-image",
            Modality::ImageToText => "image-to-text",
        }
    }

    /// Key of the model section in the YAML catalog.
    pub fn catalog_key(&self) -> &'static str {
        match self {
            Modality::TextToImage => "txt2img",
            Modality::ImageToText => "img2txt",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text-to-image" | "txt2img" | "t2i" => Ok(Modality::TextToImage),
            "image-to-text" | "img2txt" | "i2t" => Ok(Modality::ImageToText),
            other => Err(format!("unknown task '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(720, 720)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parses `"WxH"`, e.g. `"1024x768"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(|c: char| c == 'x' || c == 'X')
            .ok_or_else(|| format!("resolution '{}' is not of the form WxH", s))?;
        let width = w.trim().parse::<u32>().map_err(|e| format!("bad width in '{}': {}", s, e))?;
        let height = h.trim().parse::<u32>().map_err(|e| format!("bad height in '{}': {}", s, e))?;
        Ok(Self { width, height })
    }
}

/// A configured model. Built once at config load and shared as `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub modality: Modality,
    pub name: String,
    pub description: String,
    pub model_path: PathBuf,
    pub adapter_roots: Vec<PathBuf>,
    pub resolution_options: Vec<Resolution>,
    pub default_steps: u32,
    pub default_guidance_scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterCategory {
    Character,
    Concept,
    Style,
    Pose,
    #[default]
    Other,
}

impl AdapterCategory {
    /// Sub-directory of an adapter root holding this category, if any.
    pub fn directory(&self) -> Option<&'static str> {
        match self {
            AdapterCategory::Character => Some("characters"),
            AdapterCategory::Concept => Some("concepts"),
            AdapterCategory::Style => Some("styles"),
            AdapterCategory::Pose => Some("poses"),
            AdapterCategory::Other => None,
        }
    }
}

/// One requested LoRA. `weight: None` means "split evenly".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub id: String,
    #[serde(default)]
    pub weight: Option<f32>,
    #[serde(default)]
    pub category: AdapterCategory,
}

impl AdapterSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: None,
            category: AdapterCategory::Other,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_category(mut self, category: AdapterCategory) -> Self {
        self.category = category;
        self
    }
}

/// An adapter resident on a loaded model, addressed by its positional name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAdapter {
    pub id: String,
    pub name: String,
    pub weight: f32,
    pub category: AdapterCategory,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum ReferenceImage {
    Bytes(Vec<u8>),
    /// Relative to the configured input directory.
    Path(PathBuf),
}

pub const DEFAULT_NEGATIVE_PROMPT: &str = "deformed, distorted, disjointed, disfigured, blurry, fuzzy, morbid, mutilated, mutated anatomy, malformed anatomy, missing anatomy, fused anatomy, unnatural anatomy";
pub const DEFAULT_CAPTION_INSTRUCTIONS: &str =
    "Describe the image in detail. Format the response as a single comprehensive paragraph.";
pub const DEFAULT_CAPTION_MAX_TOKENS: u32 = 512;

#[derive(Debug, Clone)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// `None` falls back to the descriptor default.
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub resolution: Option<Resolution>,
    pub strength: f32,
    pub seed: Option<u64>,
    /// `None` leaves the active adapters as they are; `Some(vec![])` clears them.
    pub adapters: Option<Vec<AdapterSpec>>,
    pub reference_image: Option<ReferenceImage>,
}

impl TextToImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            steps: None,
            guidance_scale: None,
            resolution: None,
            strength: 0.8,
            seed: None,
            adapters: None,
            reference_image: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageToTextRequest {
    pub image: ReferenceImage,
    pub instructions: Option<String>,
    pub max_tokens: Option<u32>,
}

/// Caption every image in a folder, writing `<stem>.txt` beside each one.
#[derive(Debug, Clone, Default)]
pub struct FolderCaptionRequest {
    /// Relative to the input directory; `None` is the input directory itself.
    pub folder: Option<PathBuf>,
    pub instructions: Option<String>,
    pub max_tokens: Option<u32>,
    /// Leave images that already have a caption file alone.
    pub skip_existing: bool,
}

/// A generation request, tagged by the modality it targets.
#[derive(Debug, Clone)]
pub enum GenerationRequest {
    TextToImage(TextToImageRequest),
    ImageToText(ImageToTextRequest),
}

impl GenerationRequest {
    pub fn modality(&self) -> Modality {
        match self {
            GenerationRequest::TextToImage(_) => Modality::TextToImage,
            GenerationRequest::ImageToText(_) => Modality::ImageToText,
        }
    }
}

/// What a generation produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Image { png: Vec<u8>, width: u32, height: u32 },
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_parsing_accepts_task_names_and_aliases() {
        assert_eq!("text-to-image".parse::<Modality>(), Ok(Modality::TextToImage));
        assert_eq!("img2txt".parse::<Modality>(), Ok(Modality::ImageToText));
        assert_eq!(" I2T ".parse::<Modality>(), Ok(Modality::ImageToText));
        assert!("image-to-video".parse::<Modality>().is_err());
    }

    #[test]
    fn test_modality_serde_uses_wire_names() {
        let json = serde_json::to_string(&Modality::ImageToText).unwrap();
        assert_eq!(json, "\"image-to-text\"");
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!("1024x768".parse::<Resolution>(), Ok(Resolution::new(1024, 768)));
        assert_eq!(" 720 X 720 ".parse::<Resolution>(), Ok(Resolution::new(720, 720)));
        assert!("720".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
        assert_eq!(Resolution::new(1360, 768).to_string(), "1360x768");
    }

    #[test]
    fn test_adapter_spec_deserializes_with_defaults() {
        let spec: AdapterSpec = serde_json::from_str(r#"{"id": "z_image_anna"}"#).unwrap();
        assert_eq!(spec.weight, None);
        assert_eq!(spec.category, AdapterCategory::Other);

        let spec: AdapterSpec =
            serde_json::from_str(r#"{"id": "Rani M", "weight": 0.7, "category": "character"}"#).unwrap();
        assert_eq!(spec.weight, Some(0.7));
        assert_eq!(spec.category.directory(), Some("characters"));
    }
}
