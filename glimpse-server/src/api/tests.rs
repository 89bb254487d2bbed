use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::Engine;
use glimpse_core::{
    Catalog, EngineConfig, Governor, Invocation, Loader, ModelDescriptor, ModelLike,
};
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::{create_router, REQUEST_TIMEOUT_HEADER};
use crate::state::AppState;

/// Answers without weights: captions are fixed, queries and prompts are echoed.
struct Echo;

impl ModelLike for Echo {
    fn run(&self, invocation: &Invocation) -> anyhow::Result<Vec<String>> {
        Ok(match invocation {
            Invocation::Caption { .. } => vec!["a red square".to_string()],
            Invocation::Query { prompt, .. } => vec![format!("asked: {prompt}")],
            Invocation::Generate { prompt, .. } => vec![format!("{prompt} and then some")],
        })
    }
}

struct EchoLoader;

#[async_trait]
impl Loader for EchoLoader {
    async fn load(&self, _descriptor: &ModelDescriptor) -> anyhow::Result<Arc<dyn ModelLike>> {
        Ok(Arc::new(Echo))
    }
}

fn app() -> Router {
    let governor = Governor::new(
        &EngineConfig::default(),
        Arc::new(Catalog::builtin()),
        Arc::new(EchoLoader),
    )
    .unwrap();
    create_router(AppState::new(governor))
}

fn png() -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn assert_failure(body: &Value, kind: &str) {
    assert_eq!(body["error_kind"], kind, "body: {body}");
    assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));
    assert!(body["correlation_id"].as_str().is_some());
}

#[tokio::test]
async fn health_reports_catalog_size() {
    let req = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["models"], 7);
}

#[tokio::test]
async fn models_lists_descriptors_with_state() {
    let req = Request::get("/models").body(Body::empty()).unwrap();
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::OK);

    let models = body["models"].as_array().unwrap();
    assert_eq!(models.len(), 7);
    let moondream = models.iter().find(|m| m["key"] == "moondream-2").unwrap();
    assert_eq!(moondream["family"], "vision-vqa");
    assert_eq!(moondream["state"], "unloaded");
    assert_eq!(moondream["default_mode"], "caption");
    assert!(moondream["modes"]
        .as_array()
        .unwrap()
        .contains(&json!("visual_question_answering")));

    let smol = models.iter().find(|m| m["key"] == "smollm2-1.7b").unwrap();
    assert_eq!(smol["family"], "text-generator");
    assert_eq!(smol["default_parameters"]["max_new_tokens"], 256);
}

#[tokio::test]
async fn analyze_json_defaults_to_moondream() {
    let image = base64::engine::general_purpose::STANDARD.encode(png());
    let (status, body) = send(app(), post_json("/analyze", json!({ "image_base64": image }))).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["model_key"], "moondream-2");
    assert_eq!(body["model_family"], "vision-vqa");
    assert_eq!(body["output_text"], "asked: Describe this image in one sentence.");
    assert!(body["latency_ms"].is_u64());
}

#[tokio::test]
async fn analyze_json_answers_questions() {
    let image = base64::engine::general_purpose::STANDARD.encode(png());
    let req = post_json(
        "/analyze",
        json!({ "image_base64": image, "model": "moondream-2", "question": "What colour is it?" }),
    );
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output_text"], "asked: What colour is it?");
}

#[tokio::test]
async fn caption_accepts_multipart_uploads() {
    let boundary = "glimpse-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nblip-large\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"red.png\"\r\n\
             Content-Type: image/png\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&png());
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let req = Request::builder()
        .method(Method::POST)
        .uri("/caption")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["model_key"], "blip-large");
    assert_eq!(body["output_text"], "a red square");
}

#[tokio::test]
async fn analyze_rejects_undecodable_images() {
    let image = base64::engine::general_purpose::STANDARD.encode(b"not an image");
    let (status, body) = send(app(), post_json("/analyze", json!({ "image_base64": image }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "invalid_parameter");
}

#[tokio::test]
async fn analyze_rejects_unknown_content_types() {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/analyze")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "invalid_parameter");
}

#[tokio::test]
async fn analyze_rejects_unsupported_modes() {
    let image = base64::engine::general_purpose::STANDARD.encode(png());
    let req = post_json(
        "/analyze",
        json!({ "image_base64": image, "model": "blip-large", "mode": "ocr" }),
    );
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "invalid_mode");
}

#[tokio::test]
async fn generate_strips_the_echoed_prompt() {
    let req = post_json("/generate", json!({ "prompt": "Once upon a time" }));
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["model_key"], "smollm2-1.7b");
    assert_eq!(body["model_family"], "text-generator");
    assert_eq!(body["output_text"], "and then some");
}

#[tokio::test]
async fn generate_marks_the_model_ready() {
    let app = app();
    let req = post_json("/generate", json!({ "prompt": "hi", "model": "qwen2.5-1.5b" }));
    let (status, _) = send(app.clone(), req).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::get("/models").body(Body::empty()).unwrap();
    let (_, body) = send(app, req).await;
    let qwen = body["models"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["key"] == "qwen2.5-1.5b")
        .cloned()
        .unwrap();
    assert_eq!(qwen["state"], "ready");
    assert!(qwen["loaded_at"].is_u64());
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let req = post_json("/generate", json!({ "prompt": "hi", "model": "gpt-9" }));
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_failure(&body, "unknown_model");
}

#[tokio::test]
async fn generate_on_a_vision_model_is_a_family_mismatch() {
    let req = post_json("/generate", json!({ "prompt": "hi", "model": "blip-large" }));
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "family_mismatch");
}

#[tokio::test]
async fn out_of_range_parameters_are_rejected() {
    let req = post_json("/generate", json!({ "prompt": "hi", "temperature": 5.0 }));
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "invalid_parameter");

    let req = post_json("/generate", json!({ "prompt": "hi", "max_new_tokens": 0 }));
    let (status, _) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"prompt\":"))
        .unwrap();
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "invalid_parameter");
}

#[tokio::test]
async fn timeout_header_must_be_positive() {
    let mut req = post_json("/generate", json!({ "prompt": "hi" }));
    req.headers_mut()
        .insert(REQUEST_TIMEOUT_HEADER, "soon".parse().unwrap());
    let (status, body) = send(app(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_failure(&body, "invalid_parameter");

    let mut req = post_json("/generate", json!({ "prompt": "hi" }));
    req.headers_mut()
        .insert(REQUEST_TIMEOUT_HEADER, "5000".parse().unwrap());
    let (status, _) = send(app(), req).await;
    assert_eq!(status, StatusCode::OK);
}
