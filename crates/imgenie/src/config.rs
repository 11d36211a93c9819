// imgenie/crates/imgenie/src/config.rs

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ImgenieError;
use crate::types::{Modality, ModelDescriptor, Resolution};

pub const DEFAULT_CATALOG_PATH: &str = "imgenie/config/imgenie.config.default.yaml";
pub const DEFAULT_REFERENCE_LONG_EDGE: u32 = 720;

/// Which inference backend serves the slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Out-of-process inference worker reached over HTTP.
    Http,
    /// In-process stand-in that renders placeholder artifacts.
    Simulated,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(BackendKind::Http),
            "simulated" | "sim" => Ok(BackendKind::Simulated),
            other => Err(anyhow::anyhow!("Unknown BACKEND '{}'. Expected 'http' or 'simulated'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub catalog_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub backend: BackendKind,
    pub t2i_backend_url: String,
    pub i2t_backend_url: String,
    pub reference_long_edge: u32,
    pub generate_timeout_seconds: u64,
    pub load_timeout_seconds: u64,
    pub simulated_step_millis: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let catalog_path = PathBuf::from(
            env::var("IMGENIE_CONFIG").unwrap_or_else(|_| DEFAULT_CATALOG_PATH.into()),
        );
        let backend = env::var("BACKEND").unwrap_or_else(|_| "http".into()).parse()?;

        let reference_long_edge: u32 = env::var("REFERENCE_LONG_EDGE")
            .unwrap_or_else(|_| DEFAULT_REFERENCE_LONG_EDGE.to_string())
            .parse()
            .context("REFERENCE_LONG_EDGE must be a positive integer")?;
        if reference_long_edge < 16 {
            return Err(anyhow::anyhow!(
                "REFERENCE_LONG_EDGE must be at least 16, got {}",
                reference_long_edge
            ));
        }

        Ok(Self {
            catalog_path,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env::var("API_PORT").unwrap_or_else(|_| "5000".into()).parse()?,
            backend,
            t2i_backend_url: env::var("T2I_BACKEND_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8101".into()),
            i2t_backend_url: env::var("I2T_BACKEND_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8102".into()),
            reference_long_edge,
            generate_timeout_seconds: env::var("GENERATE_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "900".into())
                .parse()?,
            load_timeout_seconds: env::var("LOAD_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "600".into())
                .parse()?,
            simulated_step_millis: env::var("SIMULATED_STEP_MILLIS")
                .unwrap_or_else(|_| "50".into())
                .parse()?,
        })
    }

    pub fn backend_url(&self, modality: Modality) -> &str {
        match modality {
            Modality::TextToImage => &self.t2i_backend_url,
            Modality::ImageToText => &self.i2t_backend_url,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Catalog: {}", self.catalog_path.display());
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Backend: {:?}", self.backend);
        info!("- T2I Backend URL: {}", self.t2i_backend_url);
        info!("- I2T Backend URL: {}", self.i2t_backend_url);
        info!("- Reference Long Edge: {}px", self.reference_long_edge);
        info!("- Generate Timeout: {}s", self.generate_timeout_seconds);
        info!("- Load Timeout: {}s", self.load_timeout_seconds);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}

// ===== Model catalog =====

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogModelEntry {
    name: Option<String>,
    #[serde(default)]
    description: String,
    model_path: Option<String>,
    lora_path: Option<OneOrMany>,
    resolution_options: Option<Vec<String>>,
    default_steps: Option<u32>,
    default_guidance_scale: Option<f32>,
}

/// On-disk catalog layout. Model sections are `BTreeMap`s, so listings come
/// back sorted by id.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    root_dir: Option<PathBuf>,
    output_path: Option<PathBuf>,
    input_path: Option<PathBuf>,
    lora_path: Option<PathBuf>,
    #[serde(default)]
    txt2img: BTreeMap<String, CatalogModelEntry>,
    #[serde(default)]
    img2txt: BTreeMap<String, CatalogModelEntry>,
}

/// Resolved model catalog plus the directories the server works in.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub root_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub adapter_root: PathBuf,
    pub models: Vec<ModelDescriptor>,
}

const DEFAULT_OUTPUT_DIR: &str = "/root/.imgenie/output";
const DEFAULT_INPUT_DIR: &str = "/root/.imgenie/input";
const DEFAULT_LORA_DIR: &str = "/root/.imgenie/loras";

impl Catalog {
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ImgenieError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_yaml(&text)?;
        info!(
            "Loaded catalog {}: {} text-to-image, {} image-to-text models",
            path.display(),
            catalog.models_for(Modality::TextToImage).count(),
            catalog.models_for(Modality::ImageToText).count()
        );
        Ok(catalog)
    }

    pub fn from_yaml(text: &str) -> crate::error::Result<Self> {
        let file: CatalogFile = if text.trim().is_empty() {
            CatalogFile::default()
        } else {
            serde_yaml::from_str(text)
                .map_err(|e| ImgenieError::Config(format!("malformed catalog: {}", e)))?
        };

        let root_dir = file.root_dir.clone();
        let resolve = |p: &Path| -> PathBuf {
            match &root_dir {
                Some(root) if p.is_relative() => root.join(p),
                _ => p.to_path_buf(),
            }
        };

        let output_dir = resolve(file.output_path.as_deref().unwrap_or(Path::new(DEFAULT_OUTPUT_DIR)));
        let input_dir = resolve(file.input_path.as_deref().unwrap_or(Path::new(DEFAULT_INPUT_DIR)));
        let adapter_root = resolve(file.lora_path.as_deref().unwrap_or(Path::new(DEFAULT_LORA_DIR)));

        let mut models = Vec::new();
        for (modality, entries) in [
            (Modality::TextToImage, file.txt2img),
            (Modality::ImageToText, file.img2txt),
        ] {
            for (id, entry) in entries {
                models.push(Self::descriptor(modality, id, entry, &resolve, &adapter_root)?);
            }
        }

        Ok(Self {
            root_dir,
            output_dir,
            input_dir,
            adapter_root,
            models,
        })
    }

    fn descriptor(
        modality: Modality,
        id: String,
        entry: CatalogModelEntry,
        resolve: &dyn Fn(&Path) -> PathBuf,
        global_adapter_root: &Path,
    ) -> crate::error::Result<ModelDescriptor> {
        let model_path = resolve(Path::new(entry.model_path.as_deref().unwrap_or(&id)));

        let adapter_roots = match entry.lora_path {
            Some(paths) => paths.into_vec().iter().map(|p| resolve(Path::new(p))).collect(),
            None => vec![global_adapter_root.to_path_buf()],
        };

        let resolution_options = match entry.resolution_options {
            Some(options) => options
                .iter()
                .map(|r| {
                    r.parse::<Resolution>().map_err(|e| {
                        ImgenieError::Config(format!("model {}: {}", id, e))
                    })
                })
                .collect::<crate::error::Result<Vec<_>>>()?,
            None => vec![Resolution::new(720, 720), Resolution::new(1024, 1024)],
        };

        let default_steps = entry.default_steps.unwrap_or(match modality {
            Modality::TextToImage => 10,
            Modality::ImageToText => crate::types::DEFAULT_CAPTION_MAX_TOKENS,
        });
        if default_steps == 0 {
            return Err(ImgenieError::Config(format!("model {}: default_steps must be positive", id)));
        }

        Ok(ModelDescriptor {
            name: entry.name.unwrap_or_else(|| id.clone()),
            description: entry.description,
            id,
            modality,
            model_path,
            adapter_roots,
            resolution_options,
            default_steps,
            default_guidance_scale: entry.default_guidance_scale.unwrap_or(0.0),
        })
    }

    pub fn models_for(&self, modality: Modality) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(move |m| m.modality == modality)
    }

    /// Creates the output and input directories.
    pub fn ensure_directories(&self) -> crate::error::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.input_dir)?;
        Ok(())
    }
}
