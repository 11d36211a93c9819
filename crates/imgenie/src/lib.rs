// imgenie/crates/imgenie/src/lib.rs

pub mod adapters;
pub mod api;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod imaging;
pub mod metrics;
pub mod output;
pub mod progress;
pub mod registry;
pub mod server;
pub mod shared_state;
pub mod slot;
pub mod telemetry;
pub mod types;

// Public API exports
pub use adapters::{AdapterComposer, Composition};
pub use backend::{
    BackendHandle, HttpBackend, InferenceBackend, InferenceJob, ProgressCallback, SimulatedBackend, SimulatedOp,
};
pub use config::{BackendKind, Catalog, Config};
pub use coordinator::{
    CaptionedImage, FailedImage, FolderCaptionOutput, GenerationCoordinator, GenerationOutput, SlotSet,
};
pub use error::{ImgenieError, Result};
pub use output::ArtifactStore;
pub use progress::{GenerationProgress, ProgressStatus, ProgressTracker};
pub use registry::ModelRegistry;
pub use server::{build_router, run_server};
pub use shared_state::{SharedState, UnifiedAppState};
pub use slot::{ModelSlot, SlotLease, SlotState, SlotStatus};
pub use types::{
    ActiveAdapter, AdapterCategory, AdapterSpec, Artifact, FolderCaptionRequest, GenerationRequest, ImageToTextRequest,
    Modality, ModelDescriptor, ReferenceImage, Resolution, TextToImageRequest,
};
