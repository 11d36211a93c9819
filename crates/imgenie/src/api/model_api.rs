//! Model lifecycle endpoints: load, unload and slot status.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{parse_task, run_detached, ApiResult};
use crate::metrics;
use crate::shared_state::UnifiedAppState;
use crate::slot::{SlotState, SlotStatus};
use crate::types::Modality;

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    pub task: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnloadModelRequest {
    pub task: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SlotResponse {
    pub success: bool,
    pub message: String,
    pub slot: SlotStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub t2i: bool,
    pub i2t: bool,
    pub t2i_model: Option<String>,
    pub i2t_model: Option<String>,
    pub slots: Vec<SlotStatus>,
}

pub async fn load_model(
    State(state): State<UnifiedAppState>,
    Json(req): Json<LoadModelRequest>,
) -> ApiResult<SlotResponse> {
    let modality = parse_task(req.task.as_deref())?;
    info!("Load request for {} model {}", modality, req.model_id);

    let shared = state.shared_state.clone();
    let model_id = req.model_id.clone();
    let slot = run_detached("/api/model/load", async move {
        shared.load_model(modality, &model_id).await
    })
    .await?;

    Ok(Json(SlotResponse {
        success: true,
        message: format!("Model {} loaded", req.model_id),
        slot,
    }))
}

pub async fn unload_model(
    State(state): State<UnifiedAppState>,
    Json(req): Json<UnloadModelRequest>,
) -> ApiResult<SlotResponse> {
    let modality = parse_task(req.task.as_deref())?;
    let shared = state.shared_state.clone();
    let slot = run_detached("/api/model/unload", async move { shared.unload_model(modality).await }).await?;

    Ok(Json(SlotResponse {
        success: true,
        message: "Model unloaded".to_string(),
        slot,
    }))
}

pub async fn model_status(State(state): State<UnifiedAppState>) -> Json<StatusResponse> {
    let t2i = state.shared_state.slot_status(Modality::TextToImage);
    let i2t = state.shared_state.slot_status(Modality::ImageToText);
    metrics::inc_request("/api/model/status", "200");
    Json(StatusResponse {
        t2i: t2i.state == SlotState::Loaded,
        i2t: i2t.state == SlotState::Loaded,
        t2i_model: t2i.model_id.clone(),
        i2t_model: i2t.model_id.clone(),
        slots: vec![t2i, i2t],
    })
}
