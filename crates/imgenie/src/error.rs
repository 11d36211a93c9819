//! Error kinds surfaced by the control plane.
//!
//! Backends and glue code speak `anyhow`; everything that crosses a slot,
//! composer or coordinator boundary is converted into [`ImgenieError`] so the
//! transport can tell client mistakes from retryable contention from server
//! failures.

use crate::types::Modality;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImgenieError>;

#[derive(Debug, Error)]
pub enum ImgenieError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model {id} not found for {modality}")]
    NotFound { modality: Modality, id: String },

    #[error("The {0} slot is busy with another operation")]
    Busy(Modality),

    #[error("No {0} model is loaded")]
    ModelNotLoaded(Modality),

    #[error("Failed to load {target}: {cause}")]
    LoadFailed { target: String, cause: String },

    #[error("Adapter {id} not found (searched {searched:?})")]
    AdapterNotFound { id: String, searched: Vec<PathBuf> },

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImgenieError {
    /// Wraps a backend failure, keeping the whole cause chain in the message.
    pub fn load_failed(target: impl Into<String>, cause: &anyhow::Error) -> Self {
        ImgenieError::LoadFailed {
            target: target.into(),
            cause: format!("{:#}", cause),
        }
    }

    pub fn generation_failed(cause: &anyhow::Error) -> Self {
        ImgenieError::GenerationFailed(format!("{:#}", cause))
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ImgenieError::Config(_) => "config_error",
            ImgenieError::NotFound { .. } => "not_found",
            ImgenieError::Busy(_) => "busy",
            ImgenieError::ModelNotLoaded(_) => "model_not_loaded",
            ImgenieError::LoadFailed { .. } => "load_failed",
            ImgenieError::AdapterNotFound { .. } => "adapter_not_found",
            ImgenieError::GenerationFailed(_) => "generation_failed",
            ImgenieError::InvalidRequest(_) => "invalid_request",
            ImgenieError::Io(_) => "io_error",
            ImgenieError::Internal(_) => "internal_error",
        }
    }

    /// Contention only; the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ImgenieError::Busy(_))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ImgenieError::NotFound { .. }
                | ImgenieError::ModelNotLoaded(_)
                | ImgenieError::AdapterNotFound { .. }
                | ImgenieError::InvalidRequest(_)
        )
    }
}
