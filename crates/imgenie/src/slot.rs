// imgenie/crates/imgenie/src/slot.rs
//! Model slot: the single resident model of one modality.
//!
//! Load, unload and generation each need exclusive ownership of the slot for
//! their whole duration. Ownership is taken with `try_lock`, so a second
//! operation fails fast with `Busy` instead of queueing. Status is published
//! through an `ArcSwap` snapshot and can be read at any time without touching
//! the lock.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::backend::{BackendHandle, InferenceBackend};
use crate::error::{ImgenieError, Result};
use crate::metrics;
use crate::types::{ActiveAdapter, Modality, ModelDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Empty,
    Loading,
    Loaded,
    Unloading,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub modality: Modality,
    pub model_id: Option<String>,
    pub state: SlotState,
    pub generating: bool,
    pub adapters: Vec<ActiveAdapter>,
}

#[derive(Default)]
struct SlotInner {
    descriptor: Option<Arc<ModelDescriptor>>,
    handle: Option<BackendHandle>,
    adapters: Vec<ActiveAdapter>,
}

impl SlotInner {
    fn settled_state(&self) -> SlotState {
        if self.handle.is_some() {
            SlotState::Loaded
        } else {
            SlotState::Empty
        }
    }

    fn clear(&mut self) -> Option<BackendHandle> {
        self.descriptor = None;
        self.adapters.clear();
        self.handle.take()
    }
}

struct StatusBoard {
    modality: Modality,
    current: ArcSwap<SlotStatus>,
}

impl StatusBoard {
    fn publish(&self, inner: &SlotInner, state: SlotState, generating: bool) {
        self.current.store(Arc::new(SlotStatus {
            modality: self.modality,
            model_id: inner.descriptor.as_ref().map(|d| d.id.clone()),
            state,
            generating,
            adapters: inner.adapters.clone(),
        }));
    }

    fn publish_transition(&self, model_id: Option<String>, state: SlotState, adapters: Vec<ActiveAdapter>) {
        self.current.store(Arc::new(SlotStatus {
            modality: self.modality,
            model_id,
            state,
            generating: false,
            adapters,
        }));
    }
}

pub struct ModelSlot {
    modality: Modality,
    backend: Arc<dyn InferenceBackend>,
    inner: Arc<Mutex<SlotInner>>,
    board: Arc<StatusBoard>,
}

impl ModelSlot {
    pub fn new(modality: Modality, backend: Arc<dyn InferenceBackend>) -> Self {
        let board = StatusBoard {
            modality,
            current: ArcSwap::from_pointee(SlotStatus {
                modality,
                model_id: None,
                state: SlotState::Empty,
                generating: false,
                adapters: Vec::new(),
            }),
        };
        Self {
            modality,
            backend,
            inner: Arc::new(Mutex::new(SlotInner::default())),
            board: Arc::new(board),
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    /// Lock-free snapshot; never blocks, even mid-load or mid-generation.
    pub fn status(&self) -> SlotStatus {
        (**self.board.current.load()).clone()
    }

    fn try_acquire(&self, op: &str) -> Result<OwnedMutexGuard<SlotInner>> {
        self.inner.clone().try_lock_owned().map_err(|_| {
            warn!("{} slot busy, rejecting {}", self.modality, op);
            metrics::inc_busy_rejection(self.modality.as_str());
            ImgenieError::Busy(self.modality)
        })
    }

    fn transition(&self, op: &str) -> Result<Transition> {
        Ok(Transition {
            inner: self.try_acquire(op)?,
            board: self.board.clone(),
        })
    }

    /// Makes `descriptor` the resident model. Loading the model that is
    /// already resident is a no-op.
    pub async fn load(&self, descriptor: Arc<ModelDescriptor>) -> Result<()> {
        if descriptor.modality != self.modality {
            return Err(ImgenieError::InvalidRequest(format!(
                "model {} serves {}, not {}",
                descriptor.id, descriptor.modality, self.modality
            )));
        }

        let mut slot = self.transition("load")?;

        if slot.descriptor.as_ref().map(|d| d.id.as_str()) == Some(descriptor.id.as_str()) {
            info!("{} model {} already loaded", self.modality, descriptor.id);
            metrics::inc_slot_op(self.modality.as_str(), "load", "noop");
            return Ok(());
        }

        if slot.handle.is_some() {
            self.release(&mut slot).await;
        }

        self.board
            .publish_transition(Some(descriptor.id.clone()), SlotState::Loading, Vec::new());
        info!("Loading {} model {} from {}", self.modality, descriptor.id, descriptor.model_path.display());
        let started = Instant::now();

        match self.load_detached(descriptor.clone()).await {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.descriptor = Some(descriptor.clone());
                slot.adapters.clear();
                metrics::inc_slot_op(self.modality.as_str(), "load", "ok");
                info!(
                    "✅ {} model {} loaded in {:.1}s",
                    self.modality,
                    descriptor.id,
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                slot.clear();
                metrics::inc_slot_op(self.modality.as_str(), "load", "error");
                error!("Failed to load {} model {}: {:#}", self.modality, descriptor.id, e);
                Err(ImgenieError::load_failed(descriptor.id.clone(), &e))
            }
        }
    }

    /// Runs the backend load on its own task. A handle that arrives after the
    /// caller has gone away is released again instead of leaking.
    async fn load_detached(&self, descriptor: Arc<ModelDescriptor>) -> anyhow::Result<BackendHandle> {
        let backend = self.backend.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = backend.load(&descriptor).await;
            if let Err(Ok(orphan)) = tx.send(result) {
                warn!("Load of {} finished after its caller gave up, releasing it", orphan.model_id);
                if let Err(e) = backend.unload(orphan).await {
                    warn!("Releasing abandoned {} failed: {:#}", descriptor.id, e);
                }
            }
        });
        rx.await
            .map_err(|_| anyhow::anyhow!("backend load task ended without a result"))?
    }

    /// Releases the resident model. Succeeds on an empty slot, and always
    /// leaves the slot empty even if the backend fails to release.
    pub async fn unload(&self) -> Result<()> {
        let mut slot = self.transition("unload")?;
        if slot.handle.is_none() {
            metrics::inc_slot_op(self.modality.as_str(), "unload", "noop");
            return Ok(());
        }
        self.release(&mut slot).await;
        Ok(())
    }

    async fn release(&self, inner: &mut SlotInner) {
        let model_id = inner.descriptor.as_ref().map(|d| d.id.clone());
        self.board
            .publish_transition(model_id.clone(), SlotState::Unloading, inner.adapters.clone());

        let Some(handle) = inner.clear() else {
            return;
        };
        let label = model_id.unwrap_or_default();
        let backend = self.backend.clone();
        match tokio::spawn(async move { backend.unload(handle).await }).await {
            Ok(Ok(())) => {
                metrics::inc_slot_op(self.modality.as_str(), "unload", "ok");
                info!("{} model {} unloaded", self.modality, label);
            }
            Ok(Err(e)) => {
                metrics::inc_slot_op(self.modality.as_str(), "unload", "error");
                warn!("Backend failed to release {} model {}: {:#}", self.modality, label, e);
            }
            Err(e) => {
                metrics::inc_slot_op(self.modality.as_str(), "unload", "error");
                warn!("Release task for {} model {} failed: {}", self.modality, label, e);
            }
        }
    }

    /// Takes the slot for a generation. `Busy` if another operation holds it,
    /// `ModelNotLoaded` if nothing is resident.
    pub fn lease(&self) -> Result<SlotLease> {
        let guard = self.try_acquire("generate")?;
        if guard.handle.is_none() {
            return Err(ImgenieError::ModelNotLoaded(self.modality));
        }
        self.board.publish(&guard, SlotState::Loaded, true);
        Ok(SlotLease {
            modality: self.modality,
            backend: self.backend.clone(),
            guard,
            board: self.board.clone(),
        })
    }
}

/// Exclusive hold for a load or unload. Dropping it, normally or because the
/// operation's future was abandoned, publishes what the slot really holds.
struct Transition {
    inner: OwnedMutexGuard<SlotInner>,
    board: Arc<StatusBoard>,
}

impl Deref for Transition {
    type Target = SlotInner;

    fn deref(&self) -> &SlotInner {
        &self.inner
    }
}

impl DerefMut for Transition {
    fn deref_mut(&mut self) -> &mut SlotInner {
        &mut self.inner
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        self.board.publish(&self.inner, self.inner.settled_state(), false);
    }
}

/// Exclusive access to a loaded slot for the duration of one generation.
/// Dropping it makes the slot available again.
pub struct SlotLease {
    modality: Modality,
    backend: Arc<dyn InferenceBackend>,
    guard: OwnedMutexGuard<SlotInner>,
    board: Arc<StatusBoard>,
}

impl SlotLease {
    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    pub fn descriptor(&self) -> Result<Arc<ModelDescriptor>> {
        self.guard
            .descriptor
            .clone()
            .ok_or(ImgenieError::ModelNotLoaded(self.modality))
    }

    pub fn handle(&self) -> Result<&BackendHandle> {
        self.guard
            .handle
            .as_ref()
            .ok_or(ImgenieError::ModelNotLoaded(self.modality))
    }

    pub fn adapters(&self) -> &[ActiveAdapter] {
        &self.guard.adapters
    }

    pub fn set_adapters(&mut self, adapters: Vec<ActiveAdapter>) {
        self.guard.adapters = adapters;
        self.board.publish(&self.guard, SlotState::Loaded, true);
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.board.publish(&self.guard, self.guard.settled_state(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBackend, SimulatedOp};
    use crate::types::Resolution;
    use std::path::PathBuf;
    use std::time::Duration;

    fn descriptor(id: &str) -> Arc<ModelDescriptor> {
        Arc::new(ModelDescriptor {
            id: id.to_string(),
            modality: Modality::TextToImage,
            name: id.to_string(),
            description: String::new(),
            model_path: PathBuf::from("/models").join(id),
            adapter_roots: vec![],
            resolution_options: vec![Resolution::default()],
            default_steps: 4,
            default_guidance_scale: 0.0,
        })
    }

    fn slot_with(delay: Duration) -> (ModelSlot, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new(Modality::TextToImage, delay));
        (ModelSlot::new(Modality::TextToImage, backend.clone()), backend)
    }

    // ===== Load / unload =====

    #[tokio::test]
    async fn test_load_then_status() {
        let (slot, backend) = slot_with(Duration::ZERO);
        slot.load(descriptor("turbo")).await.unwrap();

        let status = slot.status();
        assert_eq!(status.model_id.as_deref(), Some("turbo"));
        assert_eq!(status.state, SlotState::Loaded);
        assert!(!status.generating);
        assert_eq!(backend.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_same_model_load_is_noop() {
        let (slot, backend) = slot_with(Duration::ZERO);
        slot.load(descriptor("turbo")).await.unwrap();
        slot.load(descriptor("turbo")).await.unwrap();
        assert_eq!(backend.calls(SimulatedOp::Load), 1);
    }

    #[tokio::test]
    async fn test_switching_models_releases_first() {
        let (slot, backend) = slot_with(Duration::ZERO);
        slot.load(descriptor("turbo")).await.unwrap();
        slot.load(descriptor("sdxl")).await.unwrap();

        assert_eq!(backend.resident_models(), vec!["sdxl".to_string()]);
        assert_eq!(backend.calls(SimulatedOp::Unload), 1);
        assert_eq!(slot.status().model_id.as_deref(), Some("sdxl"));
    }

    #[tokio::test]
    async fn test_failed_load_leaves_slot_empty() {
        let (slot, backend) = slot_with(Duration::ZERO);
        slot.load(descriptor("turbo")).await.unwrap();
        backend.inject_failure(SimulatedOp::Load, "weights missing");

        let err = slot.load(descriptor("sdxl")).await.unwrap_err();
        assert_eq!(err.kind(), "load_failed");
        assert!(err.to_string().contains("weights missing"));

        let status = slot.status();
        assert_eq!(status.state, SlotState::Empty);
        assert_eq!(status.model_id, None);
        assert_eq!(backend.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_modality_rejected() {
        let (slot, backend) = slot_with(Duration::ZERO);
        let mut captioner = (*descriptor("joycaption")).clone();
        captioner.modality = Modality::ImageToText;

        let err = slot.load(Arc::new(captioner)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert_eq!(backend.calls(SimulatedOp::Load), 0);
    }

    #[tokio::test]
    async fn test_unload_empty_is_ok() {
        let (slot, backend) = slot_with(Duration::ZERO);
        slot.unload().await.unwrap();
        assert_eq!(backend.calls(SimulatedOp::Unload), 0);
    }

    #[tokio::test]
    async fn test_unload_swallows_backend_errors() {
        let (slot, backend) = slot_with(Duration::ZERO);
        slot.load(descriptor("turbo")).await.unwrap();
        backend.inject_failure(SimulatedOp::Unload, "driver hung");

        slot.unload().await.unwrap();
        assert_eq!(slot.status().state, SlotState::Empty);
        assert_eq!(slot.status().model_id, None);
    }

    // ===== Leases =====

    #[tokio::test]
    async fn test_lease_on_empty_slot() {
        let (slot, _backend) = slot_with(Duration::ZERO);
        let err = slot.lease().err().unwrap();
        assert_eq!(err.kind(), "model_not_loaded");
        assert!(!slot.status().generating);
    }

    #[tokio::test]
    async fn test_lease_blocks_other_operations() {
        let (slot, _backend) = slot_with(Duration::ZERO);
        slot.load(descriptor("turbo")).await.unwrap();

        let lease = slot.lease().unwrap();
        assert!(slot.status().generating);
        assert!(matches!(slot.lease(), Err(ImgenieError::Busy(Modality::TextToImage))));
        assert!(matches!(slot.unload().await, Err(ImgenieError::Busy(_))));
        assert!(matches!(slot.load(descriptor("sdxl")).await, Err(ImgenieError::Busy(_))));

        drop(lease);
        assert!(!slot.status().generating);
        slot.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_readable_during_load() {
        let (slot, _backend) = slot_with(Duration::from_millis(100));
        let slot = Arc::new(slot);
        let loader = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.load(descriptor("turbo")).await })
        };

        let mut observed_loading = false;
        for _ in 0..50 {
            if slot.status().state == SlotState::Loading {
                observed_loading = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(observed_loading);
        assert!(matches!(slot.unload().await, Err(ImgenieError::Busy(_))));

        loader.await.unwrap().unwrap();
        assert_eq!(slot.status().state, SlotState::Loaded);
    }

    // ===== Abandoned operations =====

    async fn wait_for_unloads(backend: &SimulatedBackend, expected: usize) {
        for _ in 0..200 {
            if backend.calls(SimulatedOp::Unload) >= expected && backend.resident_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("backend never released the model");
    }

    #[tokio::test]
    async fn test_abandoned_load_settles_to_empty() {
        let (slot, backend) = slot_with(Duration::from_millis(150));
        let attempt = tokio::time::timeout(Duration::from_millis(20), slot.load(descriptor("turbo"))).await;
        assert!(attempt.is_err());

        let status = slot.status();
        assert_eq!(status.state, SlotState::Empty);
        assert_eq!(status.model_id, None);

        slot.unload().await.unwrap();
        assert_eq!(slot.status().state, SlotState::Empty);

        // The backend finishes the load nobody waits for and hands it back.
        wait_for_unloads(&backend, 1).await;
        assert_eq!(backend.calls(SimulatedOp::Load), 1);
    }

    #[tokio::test]
    async fn test_abandoned_unload_still_releases() {
        let (slot, backend) = slot_with(Duration::from_millis(60));
        slot.load(descriptor("turbo")).await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(10), slot.unload()).await;
        assert!(attempt.is_err());
        assert_eq!(slot.status().state, SlotState::Empty);
        assert_eq!(slot.status().model_id, None);

        wait_for_unloads(&backend, 1).await;
        slot.load(descriptor("sdxl")).await.unwrap();
        assert_eq!(backend.resident_models(), vec!["sdxl".to_string()]);
    }
}
