// imgenie/crates/imgenie/src/adapters.rs
//! LoRA composition on a leased slot.
//!
//! Requested adapters are resolved to files before anything touches the
//! backend, so a missing file rejects the whole request and leaves the active
//! set alone. Any difference from the active set is applied by unloading
//! everything and loading the new stack under positional names.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{ImgenieError, Result};
use crate::slot::SlotLease;
use crate::types::{ActiveAdapter, AdapterSpec};

const ADAPTER_EXTENSION: &str = "safetensors";

/// Outcome of [`AdapterComposer::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    Unchanged,
    Cleared,
    Applied(usize),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterComposer;

impl AdapterComposer {
    pub fn new() -> Self {
        Self
    }

    /// Synthetic backend name of the adapter at `index`.
    pub fn adapter_name(index: usize) -> String {
        format!("adapter_{}", index)
    }

    /// Rejects duplicate ids, non-finite or negative weights and ids that
    /// try to climb out of an adapter root.
    pub fn validate(requested: &[AdapterSpec]) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in requested {
            let id = spec.id.trim();
            if id.is_empty() {
                return Err(ImgenieError::InvalidRequest("adapter id must not be empty".into()));
            }
            if !seen.insert(id) {
                return Err(ImgenieError::InvalidRequest(format!("adapter {} requested twice", id)));
            }
            if Path::new(id)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(ImgenieError::InvalidRequest(format!(
                    "adapter id {} must be a plain relative name",
                    id
                )));
            }
            if let Some(weight) = spec.weight {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(ImgenieError::InvalidRequest(format!(
                        "adapter {} has invalid weight {}",
                        id, weight
                    )));
                }
            }
        }
        Ok(())
    }

    /// Explicit weights are kept; missing ones become `1/N`.
    pub fn effective_weights(requested: &[AdapterSpec]) -> Vec<f32> {
        let even = 1.0 / requested.len().max(1) as f32;
        requested.iter().map(|s| s.weight.unwrap_or(even)).collect()
    }

    /// Candidate files for `spec` under `root`, in lookup order.
    pub fn candidates(root: &Path, spec: &AdapterSpec) -> Vec<PathBuf> {
        let id = spec.id.trim();
        let file_name = format!("{}.{}", id, ADAPTER_EXTENSION);
        let mut out = Vec::with_capacity(4);

        if Path::new(id).extension().and_then(|e| e.to_str()) == Some(ADAPTER_EXTENSION) {
            out.push(root.join(id));
        }
        if let Some(dir) = spec.category.directory() {
            let compact: String = id.chars().filter(|c| !c.is_whitespace()).collect();
            out.push(root.join(dir).join(format!("{}.{}", compact, ADAPTER_EXTENSION)));
        }
        out.push(root.join(id).join(&file_name));
        out.push(root.join(&file_name));
        out
    }

    /// First existing candidate across `roots`.
    pub fn resolve(roots: &[PathBuf], spec: &AdapterSpec) -> Result<PathBuf> {
        let mut searched = Vec::new();
        for root in roots {
            for candidate in Self::candidates(root, spec) {
                if candidate.is_file() {
                    debug!("Adapter {} resolved to {}", spec.id, candidate.display());
                    return Ok(candidate);
                }
                searched.push(candidate);
            }
        }
        Err(ImgenieError::AdapterNotFound {
            id: spec.id.clone(),
            searched,
        })
    }

    /// Resolves and weights `requested` without touching the backend.
    pub fn plan(roots: &[PathBuf], requested: &[AdapterSpec]) -> Result<Vec<ActiveAdapter>> {
        Self::validate(requested)?;
        let weights = Self::effective_weights(requested);
        requested
            .iter()
            .zip(weights)
            .enumerate()
            .map(|(index, (spec, weight))| {
                Ok(ActiveAdapter {
                    id: spec.id.trim().to_string(),
                    name: Self::adapter_name(index),
                    weight,
                    category: spec.category,
                    path: Self::resolve(roots, spec)?,
                })
            })
            .collect()
    }

    fn same_stack(active: &[ActiveAdapter], desired: &[ActiveAdapter]) -> bool {
        active.len() == desired.len()
            && active
                .iter()
                .zip(desired)
                .all(|(a, d)| a.id == d.id && a.weight == d.weight)
    }

    /// Makes the lease's active adapters match `requested`.
    pub async fn apply(&self, lease: &mut SlotLease, requested: &[AdapterSpec]) -> Result<Composition> {
        let descriptor = lease.descriptor()?;
        let desired = Self::plan(&descriptor.adapter_roots, requested)?;
        self.install(lease, desired).await
    }

    /// Puts back a stack captured earlier from [`SlotLease::adapters`]. If the
    /// backend refuses, the slot is left with no adapters and `false` is
    /// returned.
    pub async fn restore(&self, lease: &mut SlotLease, previous: Vec<ActiveAdapter>) -> bool {
        let wanted = previous.len();
        match self.install(lease, previous).await {
            Ok(Composition::Unchanged) => true,
            Ok(_) => {
                info!("Restored {} adapter(s) after a failed request", wanted);
                true
            }
            Err(e) => {
                warn!("Could not restore previous adapters, slot left without adapters: {}", e);
                false
            }
        }
    }

    async fn install(&self, lease: &mut SlotLease, desired: Vec<ActiveAdapter>) -> Result<Composition> {
        let model_id = lease.descriptor()?.id.clone();

        if Self::same_stack(lease.adapters(), &desired) {
            debug!("Adapter stack unchanged ({} active)", desired.len());
            return Ok(Composition::Unchanged);
        }

        let backend = lease.backend().clone();
        let had_active = !lease.adapters().is_empty();

        if had_active {
            let handle = lease.handle()?;
            let unloaded = backend.unload_adapters(handle).await;
            lease.set_adapters(Vec::new());
            if let Err(e) = unloaded {
                return Err(ImgenieError::load_failed("adapters", &e));
            }
        }

        if desired.is_empty() {
            info!("Cleared adapters on {}", model_id);
            return Ok(Composition::Cleared);
        }

        let handle = lease.handle()?;
        let mut outcome = Ok(());
        for adapter in &desired {
            if let Err(e) = backend.load_adapter(handle, &adapter.name, &adapter.path).await {
                outcome = Err(ImgenieError::load_failed(format!("adapter {}", adapter.id), &e));
                break;
            }
        }
        if outcome.is_ok() {
            let names: Vec<String> = desired.iter().map(|a| a.name.clone()).collect();
            let weights: Vec<f32> = desired.iter().map(|a| a.weight).collect();
            if let Err(e) = backend.set_adapter_weights(handle, &names, &weights).await {
                outcome = Err(ImgenieError::load_failed("adapter weights", &e));
            }
        }

        if let Err(err) = outcome {
            if let Err(e) = backend.unload_adapters(handle).await {
                warn!("Cleanup after failed adapter load also failed: {:#}", e);
            }
            return Err(err);
        }

        for adapter in &desired {
            info!(
                "Adapter {} = {} (weight {:.3}) from {}",
                adapter.name,
                adapter.id,
                adapter.weight,
                adapter.path.display()
            );
        }
        let applied = desired.len();
        lease.set_adapters(desired);
        Ok(Composition::Applied(applied))
    }
}
