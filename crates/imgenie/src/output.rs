// imgenie/crates/imgenie/src/output.rs
//! Persists generated artifacts under the output directory, and caption
//! files beside the images they describe.

use chrono::Local;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::types::Artifact;

const PROMPT_PREFIX_CHARS: usize = 20;
const MAX_SUFFIX: u32 = 10_000;

/// Filename-safe prefix of a prompt: first 20 characters, keeping
/// alphanumerics, spaces and underscores, spaces turned into underscores.
pub fn safe_prompt(prompt: &str) -> String {
    let safe: String = prompt
        .chars()
        .take(PROMPT_PREFIX_CHARS)
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    let safe = safe.trim_matches('_').to_string();
    if safe.is_empty() {
        "image".to_string()
    } else {
        safe
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes `artifact` as `<timestamp>_<safe prompt>.<ext>`, adding `_1`,
    /// `_2`, ... when the name is taken. Never overwrites an existing file.
    pub fn save(&self, artifact: &Artifact, prompt: &str) -> Result<PathBuf> {
        let (bytes, extension): (&[u8], &str) = match artifact {
            Artifact::Image { png, .. } => (png, "png"),
            Artifact::Text(text) => (text.as_bytes(), "txt"),
        };
        std::fs::create_dir_all(&self.output_dir)?;

        let stem = format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), safe_prompt(prompt));
        for attempt in 0..MAX_SUFFIX {
            let name = if attempt == 0 {
                format!("{}.{}", stem, extension)
            } else {
                format!("{}_{}.{}", stem, attempt, extension)
            };
            let path = self.output_dir.join(name);
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(bytes)?;
                    info!("Saved artifact to {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for {} in {}", stem, self.output_dir.display()),
        )
        .into())
    }

    /// Caption file that belongs to `image`: same folder, same stem, `.txt`.
    pub fn caption_path(image: &Path) -> PathBuf {
        image.with_extension("txt")
    }

    /// Writes `text` next to `image`, replacing an older caption.
    pub fn write_caption(&self, image: &Path, text: &str) -> Result<PathBuf> {
        let path = Self::caption_path(image);
        std::fs::write(&path, text)?;
        info!("Saved caption to {}", path.display());
        Ok(path)
    }
}
