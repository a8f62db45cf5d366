//! HTTP tests for the streaming endpoint, driven through `tower::ServiceExt::oneshot`.

mod common;

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
use axum::Router;
use common::{pipeline, ScriptedGenerator};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tarifin_stream::config::{GenerationConfig, ServerConfig};
use tarifin_stream::inference::Pipeline;
use tarifin_stream::server::build_router;
use tarifin_stream::tokenizer::ByteTokenizer;
use tarifin_stream::Telemetry;
use tower::ServiceExt;

const PROMPT: &str = "Tarifin: Bir tavuk yemeği öner, 30 dakikada hazır olsun.";

fn app(gen: &ScriptedGenerator) -> (Router, Arc<Pipeline>) {
    app_with(gen, GenerationConfig::default())
}

fn app_with(gen: &ScriptedGenerator, config: GenerationConfig) -> (Router, Arc<Pipeline>) {
    let p = Arc::new(pipeline(gen, config).with_telemetry(Arc::new(Telemetry::new())));
    (build_router(Arc::clone(&p), &ServerConfig::default()), p)
}

fn json_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/generate")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _) = app(&ScriptedGenerator::new(PROMPT));
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "OK");
}

#[tokio::test]
async fn blank_text_is_bad_request() {
    let gen = ScriptedGenerator::new(PROMPT);
    let (app, _) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": "   " })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(resp).await.contains("no input text provided"));
    assert_eq!(gen.counters.started(), 0);
}

#[tokio::test]
async fn missing_text_is_bad_request() {
    let gen = ScriptedGenerator::new(PROMPT);
    let (app, _) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(gen.counters.started(), 0);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let (app, _) = app(&ScriptedGenerator::new(PROMPT));
    let req = Request::builder()
        .method("POST")
        .uri("/generate")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{\"text\": "))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streams_plain_text_body() {
    let recipe = "Tavuğu küp küp doğrayın ve soğanla soteleyin.";
    let gen = ScriptedGenerator::new(PROMPT).script_text(recipe);
    let (app, p) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({
            "text": PROMPT,
            "max_new_tokens": recipe.len(),
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    let text = body_text(resp).await;
    assert_eq!(text, recipe);
    assert!(!text.contains(PROMPT));

    let metrics = p.telemetry().unwrap();
    assert_eq!(metrics.sessions_started(), 1);
    assert_eq!(metrics.sessions_ended(), 1);
}

#[tokio::test]
async fn accepts_form_body() {
    let gen = ScriptedGenerator::new("Tarifin").script_text("abc");
    let (app, _) = app(&gen);
    let req = Request::builder()
        .method("POST")
        .uri("/generate")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("text=Tarifin&max_new_tokens=3"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "abc");
}

#[tokio::test]
async fn immediate_stop_returns_empty_body() {
    let gen = ScriptedGenerator::new(PROMPT).script_ids(vec![ByteTokenizer::EOS]);
    let (app, _) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": PROMPT })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "");
}

#[tokio::test]
async fn failure_before_output_is_server_error() {
    let gen = ScriptedGenerator::new(PROMPT).fail_at(0);
    let (app, _) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": PROMPT })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(resp).await.contains("scripted failure"));
}

#[tokio::test]
async fn failure_after_output_aborts_body() {
    let gen = ScriptedGenerator::new(PROMPT).script_text("abcdef").fail_at(4);
    let (app, _) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": PROMPT })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.into_body().collect().await.is_err());
}

#[tokio::test]
async fn dropping_body_mid_stream_cancels_worker() {
    let gen = ScriptedGenerator::new(PROMPT).step_delay(Duration::from_millis(2));
    let (app, p) = app(&gen);
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": PROMPT })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    assert!(!frame.into_data().unwrap().is_empty());
    drop(body);

    let mut released = false;
    for _ in 0..200 {
        if gen.counters.live() == 0 && p.device().available() == 1 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "worker kept the device after disconnect");
    assert_eq!(p.telemetry().unwrap().sessions_ended(), 1);
}

#[tokio::test]
async fn timeout_after_output_aborts_body() {
    let gen = ScriptedGenerator::new(PROMPT).stall_at(1, Duration::from_millis(1500));
    let config = GenerationConfig {
        session_timeout_secs: 1,
        ..Default::default()
    };
    let (app, _) = app_with(&gen, config);
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": PROMPT })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.into_body().collect().await.is_err());
}

#[tokio::test]
async fn busy_device_is_service_unavailable() {
    let gen = ScriptedGenerator::new(PROMPT);
    let (app, p) = app(&gen);
    let _held = p.device().try_acquire().unwrap();
    let resp = app
        .oneshot(json_request(serde_json::json!({ "text": PROMPT })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(gen.counters.started(), 0);
}

#[tokio::test]
async fn metrics_exports_prometheus_text() {
    let gen = ScriptedGenerator::new(PROMPT);
    let (app, _) = app(&gen);
    let resp = app
        .clone()
        .oneshot(json_request(serde_json::json!({ "text": "" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = body_text(resp).await;
    assert!(text.contains("tarifin_rejections_total{reason=\"invalid\"} 1"));
    assert!(text.contains("# TYPE tarifin_session_duration_ms histogram"));
}
