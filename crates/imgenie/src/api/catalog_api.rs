//! Read-only catalog endpoints and health.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sysinfo::System;

use super::{parse_task, ApiError, ApiResult};
use crate::metrics;
use crate::shared_state::UnifiedAppState;
use crate::types::{Modality, ModelDescriptor};

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub task: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub model_path: String,
}

impl From<&ModelDescriptor> for ModelSummary {
    fn from(d: &ModelDescriptor) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            description: d.description.clone(),
            model_path: d.model_path.display().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolutionsResponse {
    pub model_id: String,
    pub task: Modality,
    pub resolutions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub memory_usage: String,
    pub t2i_model: Option<String>,
    pub i2t_model: Option<String>,
}

pub async fn health(State(state): State<UnifiedAppState>) -> Json<HealthResponse> {
    let shared = &state.shared_state;
    let memory_usage = {
        let mut sys = System::new();
        sys.refresh_memory();
        format!("{}/{} MB", sys.used_memory() / 1024 / 1024, sys.total_memory() / 1024 / 1024)
    };
    metrics::inc_request("/api/health", "200");
    Json(HealthResponse {
        status: "healthy",
        uptime_seconds: shared.started_at.elapsed().as_secs(),
        memory_usage,
        t2i_model: shared.slot_status(Modality::TextToImage).model_id,
        i2t_model: shared.slot_status(Modality::ImageToText).model_id,
    })
}

pub async fn list_models(
    State(state): State<UnifiedAppState>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Vec<ModelSummary>> {
    let modality = parse_task(query.task.as_deref())?;
    let models = state
        .shared_state
        .registry
        .list(modality)
        .iter()
        .map(|d| ModelSummary::from(d.as_ref()))
        .collect();
    metrics::inc_request("/api/models", "200");
    Ok(Json(models))
}

pub async fn model_resolutions(
    State(state): State<UnifiedAppState>,
    Path(model_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<ResolutionsResponse> {
    let modality = parse_task(query.task.as_deref())?;
    let resolutions = state
        .shared_state
        .registry
        .resolutions(modality, &model_id)
        .map_err(ApiError::from)?;
    metrics::inc_request("/api/models/:id/resolutions", "200");
    Ok(Json(ResolutionsResponse {
        model_id,
        task: modality,
        resolutions: resolutions.iter().map(|r| r.to_string()).collect(),
    }))
}

/// Catalog view keyed the way the YAML file is: `txt2img` / `img2txt`.
pub async fn app_config(
    State(state): State<UnifiedAppState>,
) -> Json<BTreeMap<&'static str, BTreeMap<String, ModelDescriptor>>> {
    let registry = &state.shared_state.registry;
    let view = Modality::ALL
        .iter()
        .map(|modality| {
            let models = registry
                .list(*modality)
                .iter()
                .map(|d| (d.id.clone(), (**d).clone()))
                .collect();
            (modality.catalog_key(), models)
        })
        .collect();
    metrics::inc_request("/api/app-config", "200");
    Json(view)
}
