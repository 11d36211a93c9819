// imgenie/crates/imgenie/src/progress.rs
//! Process-wide progress of the most recent generation.
//!
//! Readers get an immutable snapshot from an `ArcSwap`, so a poller never sees
//! a step from one request paired with the total of another. Every `reset`
//! opens a new request id; callbacks still held by a superseded request carry
//! the old id and are ignored.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::backend::ProgressCallback;
use crate::types::Modality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Idle,
    Starting,
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationProgress {
    pub status: ProgressStatus,
    pub step: u32,
    pub total_steps: u32,
    pub percent: u32,
    pub message: String,
    pub modality: Option<Modality>,
    pub request_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationProgress {
    fn idle() -> Self {
        Self {
            status: ProgressStatus::Idle,
            step: 0,
            total_steps: 0,
            percent: 0,
            message: "Ready".to_string(),
            modality: None,
            request_id: None,
            updated_at: Utc::now(),
        }
    }
}

fn percent_of(step: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (step as u64 * 100 / total as u64) as u32
}

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<ArcSwap<GenerationProgress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(GenerationProgress::idle())),
        }
    }

    pub fn get(&self) -> GenerationProgress {
        (**self.inner.load()).clone()
    }

    /// Starts tracking a new request, superseding whatever came before.
    pub fn reset(&self, modality: Modality, total_steps: u32) -> Uuid {
        let request_id = Uuid::new_v4();
        self.inner.store(Arc::new(GenerationProgress {
            status: ProgressStatus::Starting,
            step: 0,
            total_steps,
            percent: 0,
            message: format!("Starting {} generation", modality),
            modality: Some(modality),
            request_id: Some(request_id),
            updated_at: Utc::now(),
        }));
        request_id
    }

    /// Reports a request that failed before reaching the backend. A request of
    /// another modality that is still running keeps the display.
    pub fn reject(&self, modality: Modality, message: impl Into<String>) {
        let message = message.into();
        self.inner.rcu(|current| {
            if matches!(current.status, ProgressStatus::Starting | ProgressStatus::Generating) {
                return Arc::clone(current);
            }
            Arc::new(GenerationProgress {
                status: ProgressStatus::Failed,
                step: 0,
                total_steps: 0,
                percent: 0,
                message: message.clone(),
                modality: Some(modality),
                request_id: Some(Uuid::new_v4()),
                updated_at: Utc::now(),
            })
        });
    }

    /// Records `step` for `request_id`. Stale requests and backwards steps are
    /// ignored; steps past the total are clamped.
    pub fn update(&self, request_id: Uuid, step: u32) {
        self.inner.rcu(|current| {
            if current.request_id != Some(request_id)
                || step < current.step
                || matches!(current.status, ProgressStatus::Completed | ProgressStatus::Failed)
            {
                return Arc::clone(current);
            }
            let step = step.min(current.total_steps);
            Arc::new(GenerationProgress {
                status: ProgressStatus::Generating,
                step,
                percent: percent_of(step, current.total_steps),
                message: format!("Step {}/{}", step, current.total_steps),
                updated_at: Utc::now(),
                ..(**current).clone()
            })
        });
    }

    /// Callback handed to the backend for `request_id`.
    pub fn callback(&self, request_id: Uuid) -> ProgressCallback {
        let tracker = self.clone();
        Arc::new(move |step| tracker.update(request_id, step))
    }

    pub fn complete(&self, request_id: Uuid) {
        self.finish(request_id, ProgressStatus::Completed, "Generation complete".to_string());
    }

    pub fn fail(&self, request_id: Uuid, message: impl Into<String>) {
        self.finish(request_id, ProgressStatus::Failed, message.into());
    }

    fn finish(&self, request_id: Uuid, status: ProgressStatus, message: String) {
        self.inner.rcu(|current| {
            if current.request_id != Some(request_id) {
                return Arc::clone(current);
            }
            let step = if status == ProgressStatus::Completed {
                current.total_steps
            } else {
                current.step
            };
            let percent = if status == ProgressStatus::Completed {
                100
            } else {
                current.percent
            };
            Arc::new(GenerationProgress {
                status,
                step,
                percent,
                message: message.clone(),
                updated_at: Utc::now(),
                ..(**current).clone()
            })
        });
    }
}
