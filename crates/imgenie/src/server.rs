//! Server startup and routing
//!
//! All handlers reach the control plane through [`UnifiedAppState`]; the only
//! network hops are to the inference workers behind the HTTP backends.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{
    config::{Catalog, Config},
    shared_state::{SharedState, UnifiedAppState},
};

/// Largest request body accepted, sized for inline base64 images.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let catalog = Catalog::load(&cfg.catalog_path)?;
    catalog.ensure_directories()?;
    info!("Output directory: {}", catalog.output_dir.display());
    info!("Input directory: {}", catalog.input_dir.display());

    let shared_state = Arc::new(SharedState::new(cfg.clone(), catalog)?);
    let unified_state = UnifiedAppState::new(shared_state);

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let request_timeout = Duration::from_secs(cfg.generate_timeout_seconds.max(cfg.load_timeout_seconds) + 30);
    let app = build_router(unified_state, request_timeout);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: UnifiedAppState, request_timeout: Duration) -> axum::Router {
    use axum::{
        extract::DefaultBodyLimit,
        routing::{get, post},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    use crate::api::{catalog_api, generate_api, model_api};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(catalog_api::health))
        .route("/api/models", get(catalog_api::list_models))
        .route("/api/models/:id/resolutions", get(catalog_api::model_resolutions))
        .route("/api/app-config", get(catalog_api::app_config))
        .route("/api/model/load", post(model_api::load_model))
        .route("/api/model/unload", post(model_api::unload_model))
        .route("/api/model/status", get(model_api::model_status))
        .route("/api/generate", post(generate_api::generate))
        .route("/api/describe-folder", post(generate_api::describe_folder))
        .route("/api/progress", get(generate_api::progress))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}
