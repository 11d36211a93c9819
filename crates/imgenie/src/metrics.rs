// imgenie/crates/imgenie/src/metrics.rs

use prometheus::{Encoder, TextEncoder, Registry, IntCounterVec, HistogramVec};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use axum::response::IntoResponse;
use axum::http::StatusCode;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static SLOT_OPS: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATION_TIME: OnceLock<HistogramVec> = OnceLock::new();
static BUSY_REJECTIONS: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(name: &str, help: &str, labels: &[&str]) -> Option<IntCounterVec> {
    match IntCounterVec::new(prometheus::opts!(name, help), labels) {
        Ok(c) => Some(c),
        Err(e) => {
            error!("Failed to create metric {}: {}", name, e);
            None
        }
    }
}

pub fn init_metrics() {
    if let Some(c) = counter("requests_total", "Total requests per route", &["route", "status"]) {
        if REQ_COUNTER.set(c.clone()).is_ok() {
            REGISTRY.register(Box::new(c)).ok();
        }
    }

    if let Some(c) = counter(
        "slot_operations_total",
        "Model slot load/unload operations",
        &["modality", "op", "status"],
    ) {
        if SLOT_OPS.set(c.clone()).is_ok() {
            REGISTRY.register(Box::new(c)).ok();
        }
    }

    if let Some(c) = counter("generations_total", "Generations by outcome", &["modality", "status"]) {
        if GENERATIONS.set(c.clone()).is_ok() {
            REGISTRY.register(Box::new(c)).ok();
        }
    }

    if let Some(c) = counter(
        "busy_rejections_total",
        "Operations rejected because the slot was held",
        &["modality"],
    ) {
        if BUSY_REJECTIONS.set(c.clone()).is_ok() {
            REGISTRY.register(Box::new(c)).ok();
        }
    }

    let histogram = HistogramVec::new(
        prometheus::HistogramOpts::new("generation_seconds", "Wall time of successful generations")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0, 320.0]),
        &["modality"],
    );
    match histogram {
        Ok(h) => {
            if GENERATION_TIME.set(h.clone()).is_ok() {
                REGISTRY.register(Box::new(h)).ok();
            }
        }
        Err(e) => error!("Failed to create metric generation_seconds: {}", e),
    }
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_slot_op(modality: &str, op: &str, status: &str) {
    if let Some(counter) = SLOT_OPS.get() {
        counter.with_label_values(&[modality, op, status]).inc();
    }
}

pub fn inc_generation(modality: &str, status: &str) {
    if let Some(counter) = GENERATIONS.get() {
        counter.with_label_values(&[modality, status]).inc();
    }
}

pub fn inc_busy_rejection(modality: &str) {
    if let Some(counter) = BUSY_REJECTIONS.get() {
        counter.with_label_values(&[modality]).inc();
    }
}

pub fn observe_generation(modality: &str, seconds: f64) {
    if let Some(histogram) = GENERATION_TIME.get() {
        histogram.with_label_values(&[modality]).observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_render_after_init() {
        init_metrics();
        init_metrics();
        inc_request("/api/health", "200");
        inc_slot_op("text-to-image", "load", "ok");
        observe_generation("text-to-image", 1.5);

        let response = get_metrics().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("requests_total"));
        assert!(text.contains("slot_operations_total"));
        assert!(text.contains("generation_seconds"));
    }
}
