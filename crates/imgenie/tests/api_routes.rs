//! Router-level tests: request in, JSON and status codes out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::{prelude::BASE64_STANDARD, Engine};
use serde_json::{json, Value};
use tower::ServiceExt;

use imgenie::{
    build_router, BackendKind, Catalog, Config, SharedState, SimulatedBackend, UnifiedAppState, Modality,
};

fn create_test_config() -> Config {
    Config {
        catalog_path: PathBuf::from("/test/imgenie.yaml"),
        api_host: "127.0.0.1".to_string(),
        api_port: 5000,
        backend: BackendKind::Simulated,
        t2i_backend_url: "http://127.0.0.1:8101".to_string(),
        i2t_backend_url: "http://127.0.0.1:8102".to_string(),
        reference_long_edge: 720,
        generate_timeout_seconds: 900,
        load_timeout_seconds: 600,
        simulated_step_millis: 0,
    }
}

fn app(root: &tempfile::TempDir) -> Router {
    let yaml = format!(
        "root_dir: {}\noutput_path: out\ninput_path: in\n\
         txt2img:\n  turbo:\n    name: Turbo\n    resolution_options: [\"64x64\", \"128x96\"]\n    default_steps: 3\n\
         img2txt:\n  joy:\n    description: captioner\n",
        root.path().display()
    );
    let catalog = Catalog::from_yaml(&yaml).unwrap();
    catalog.ensure_directories().unwrap();
    let state = SharedState::with_backends(
        create_test_config(),
        catalog,
        Arc::new(SimulatedBackend::new(Modality::TextToImage, Duration::ZERO)),
        Arc::new(SimulatedBackend::new(Modality::ImageToText, Duration::ZERO)),
    )
    .unwrap();
    build_router(UnifiedAppState::new(Arc::new(state)), Duration::from_secs(30))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const BOUNDARY: &str = "imgenie-test-boundary";

/// `multipart/form-data` body with text fields and one `image` file.
fn post_upload(fields: &[(&str, &str)], filename: &str, file: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(file);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/generate")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    imgenie::imaging::encode_png(&img).unwrap()
}

#[tokio::test]
async fn health_and_catalog() {
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);

    let (status, body) = send(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (_, body) = send(&app, get("/api/models?task=text-to-image")).await;
    assert_eq!(body[0]["id"], "turbo");
    assert_eq!(body[0]["name"], "Turbo");

    let (_, body) = send(&app, get("/api/models?task=image-to-text")).await;
    assert_eq!(body[0]["description"], "captioner");

    let (status, body) = send(&app, get("/api/models/turbo/resolutions?task=text-to-image")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolutions"], json!(["64x64", "128x96"]));

    let (status, body) = send(&app, get("/api/models/missing/resolutions")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "not_found");

    let (_, body) = send(&app, get("/api/app-config")).await;
    assert!(body["txt2img"]["turbo"].is_object());
    assert!(body["img2txt"]["joy"].is_object());
}

#[tokio::test]
async fn load_generate_unload() {
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);

    let (status, body) = send(&app, post("/api/generate", json!({"prompt": "a fox"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "model_not_loaded");

    let (status, body) = send(&app, post("/api/model/load", json!({"model_id": "turbo", "task": "text-to-image"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slot"]["state"], "loaded");

    let (_, body) = send(&app, get("/api/model/status")).await;
    assert_eq!(body["t2i"], true);
    assert_eq!(body["t2i_model"], "turbo");
    assert_eq!(body["i2t"], false);

    let (status, body) = send(
        &app,
        post("/api/generate", json!({"prompt": "a fox", "resolution": "128x96", "seed": 7})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["seed"], 7);
    assert_eq!((body["width"].clone(), body["height"].clone()), (json!(128), json!(96)));
    assert!(body["image"].as_str().unwrap().starts_with("data:image/png;base64,"));
    assert!(PathBuf::from(body["saved_path"].as_str().unwrap()).is_file());

    let (_, body) = send(&app, get("/api/progress")).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["percent"], 100);

    let (status, body) = send(&app, post("/api/model/unload", json!({"task": "text-to-image"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slot"]["state"], "empty");
}

#[tokio::test]
async fn caption_round() {
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);
    send(&app, post("/api/model/load", json!({"model_id": "joy", "task": "image-to-text"}))).await;

    let png = {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(20, 40));
        imgenie::imaging::encode_png(&img).unwrap()
    };
    let (status, body) = send(
        &app,
        post(
            "/api/generate",
            json!({"task": "image-to-text", "image": BASE64_STANDARD.encode(png), "max_tokens": 2}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "A portrait");
}

#[tokio::test]
async fn request_validation() {
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);
    send(&app, post("/api/model/load", json!({"model_id": "turbo"}))).await;

    let (status, body) = send(&app, post("/api/generate", json!({"prompt": "x", "steps": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_request");

    let (status, _) = send(&app, post("/api/generate", json!({"prompt": "x", "resolution": "100x64"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post("/api/generate", json!({"prompt": "x", "adapters": [{"id": "ghost"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "adapter_not_found");

    let (status, _) = send(&app, post("/api/model/load", json!({"model_id": "turbo", "task": "video"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, post("/api/model/load", json!({"model_id": "nope"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn caption_upload() {
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);
    send(&app, post("/api/model/load", json!({"model_id": "joy", "task": "image-to-text"}))).await;

    let (status, body) = send(
        &app,
        post_upload(&[("task", "image-to-text"), ("max_tokens", "2")], "holiday.PNG", &png_bytes(40, 20)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "A landscape");
    assert_eq!(body["filename"], "holiday.PNG");

    let (status, body) = send(&app, post_upload(&[], "notes.txt", b"plain text")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid file type");

    let (status, body) = send(&app, post_upload(&[("task", "text-to-image")], "cat.png", &png_bytes(8, 8))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_request");

    let (status, body) = send(&app, post_upload(&[], "cat.webp", b"not really webp")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_request");
}

#[tokio::test]
async fn describe_folder_route() {
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);
    let folder = root.path().join("in").join("shoot");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("one.png"), png_bytes(30, 30)).unwrap();
    std::fs::write(folder.join("two.png"), png_bytes(10, 30)).unwrap();

    let (status, body) = send(&app, post("/api/describe-folder", json!({"folder": "shoot"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "model_not_loaded");

    send(&app, post("/api/model/load", json!({"model_id": "joy", "task": "image-to-text"}))).await;
    let (status, body) = send(
        &app,
        post("/api/describe-folder", json!({"folder": "shoot", "max_tokens": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["described"].as_array().unwrap().len(), 2);
    assert_eq!(std::fs::read_to_string(folder.join("one.txt")).unwrap(), "A square");
    assert_eq!(std::fs::read_to_string(folder.join("two.txt")).unwrap(), "A portrait");

    let (status, body) = send(
        &app,
        post("/api/describe-folder", json!({"folder": "shoot", "skip_existing": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, post("/api/describe-folder", json!({"folder": "../.."}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post("/api/describe-folder", json!({"max_tokens": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn metrics_endpoint() {
    imgenie::metrics::init_metrics();
    let root = tempfile::tempdir().unwrap();
    let app = app(&root);
    send(&app, get("/api/health")).await;

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("requests_total"));
}
