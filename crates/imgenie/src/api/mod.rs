// imgenie/crates/imgenie/src/api/mod.rs
//! HTTP API: thin handlers over [`SharedState`](crate::shared_state::SharedState).

pub mod catalog_api;
pub mod generate_api;
pub mod model_api;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::future::Future;
use tracing::{error, warn};

use crate::error::ImgenieError;
use crate::metrics;
use crate::types::Modality;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: String,
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<ImgenieError> for ApiError {
    fn from(err: ImgenieError) -> Self {
        let status = match &err {
            ImgenieError::NotFound { .. } => StatusCode::NOT_FOUND,
            ImgenieError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && !err.is_retryable() {
            error!("Request failed: {}", err);
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            success: false,
            kind: self.kind.to_string(),
            error: self.message,
        });
        if self.retryable {
            (self.status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs a core operation on its own task so that a dropped connection or a
/// timed-out request cannot abandon it halfway.
pub async fn run_detached<F, T>(route: &'static str, operation: F) -> Result<T, ApiError>
where
    F: Future<Output = crate::error::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let outcome = match tokio::spawn(operation).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            warn!("{} task did not complete: {}", route, e);
            Err(ApiError::from(ImgenieError::Internal(format!("{} task failed: {}", route, e))))
        }
    };
    let status = match &outcome {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status,
    };
    metrics::inc_request(route, status.as_str());
    outcome
}

/// Parses the `task` field, defaulting to text-to-image.
pub fn parse_task(task: Option<&str>) -> Result<Modality, ApiError> {
    match task {
        None => Ok(Modality::TextToImage),
        Some(t) => t.parse().map_err(ApiError::bad_request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ImgenieError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (ImgenieError::ModelNotLoaded(Modality::TextToImage), StatusCode::BAD_REQUEST),
            (
                ImgenieError::AdapterNotFound { id: "a".into(), searched: vec![] },
                StatusCode::BAD_REQUEST,
            ),
            (
                ImgenieError::NotFound { modality: Modality::TextToImage, id: "m".into() },
                StatusCode::NOT_FOUND,
            ),
            (ImgenieError::Busy(Modality::ImageToText), StatusCode::SERVICE_UNAVAILABLE),
            (ImgenieError::GenerationFailed("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                ImgenieError::LoadFailed { target: "m".into(), cause: "oom".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_busy_response_has_retry_after() {
        let response = ApiError::from(ImgenieError::Busy(Modality::TextToImage)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_parse_task() {
        assert_eq!(parse_task(None).unwrap(), Modality::TextToImage);
        assert_eq!(parse_task(Some("image-to-text")).unwrap(), Modality::ImageToText);
        assert_eq!(parse_task(Some("video")).unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    async fn explode() -> crate::error::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_run_detached_maps_panics() {
        let result = run_detached("test", explode()).await;
        assert_eq!(result.unwrap_err().status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
