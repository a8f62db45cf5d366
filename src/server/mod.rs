//! HTTP API server for tarifin-stream.
//!
//! `POST /generate` streams generated text as a chunked `text/plain` body.
//! Errors found before the first fragment become plain-text error responses;
//! a failure after output has started aborts the body.

use crate::config::ServerConfig;
use crate::errors::StreamError;
use crate::inference::{GenerationRequest, Pipeline, RelayStart, StreamRelay};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequest, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
}

/// Build the router. Exposed separately from [`run_server`] for tests.
pub fn build_router(pipeline: Arc<Pipeline>, config: &ServerConfig) -> Router {
    let state = ServerState { pipeline };
    let app = Router::new()
        .route("/", get(serve_ui))
        .route("/health", get(health_check))
        .route("/generate", post(generate))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if config.cors_permissive {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        app
    }
}

/// Serve until Ctrl-C. Shutdown cancels every in-flight session, so open
/// streams end promptly instead of holding the process.
pub async fn run_server(pipeline: Arc<Pipeline>, config: &ServerConfig) -> Result<(), StreamError> {
    let shutdown = pipeline.shutdown_token();
    let app = build_router(pipeline, config);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server running on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("failed to listen for Ctrl-C: {}", e);
                return;
            }
            tracing::info!("shutdown requested; cancelling in-flight sessions");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

/// Serves the embedded prompt page.
async fn serve_ui() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        include_str!("../../static/index.html"),
    )
}

async fn health_check() -> &'static str {
    "OK"
}

async fn generate(
    State(state): State<ServerState>,
    GenerateBody(req): GenerateBody,
) -> Result<Response, ApiError> {
    let session = state.pipeline.start(req)?;
    let response = match StreamRelay::new(session).start().await? {
        RelayStart::Streaming(body) => {
            tracing::debug!(session = body.session_id(), "streaming response");
            (
                [(header::CONTENT_TYPE, TEXT_PLAIN)],
                Body::from_stream(body.into_stream()),
            )
                .into_response()
        }
        RelayStart::Empty => ([(header::CONTENT_TYPE, TEXT_PLAIN)], "").into_response(),
    };
    Ok(response)
}

async fn metrics(State(state): State<ServerState>) -> Response {
    match state.pipeline.telemetry() {
        Some(t) => ([(header::CONTENT_TYPE, TEXT_PLAIN)], t.export_metrics()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// Request body for `/generate`: JSON, or a url-encoded form post.
pub struct GenerateBody(pub GenerationRequest);

#[async_trait]
impl<S> FromRequest<S> for GenerateBody
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            let Form(body) = Form::<GenerationRequest>::from_request(req, state)
                .await
                .map_err(|e| ApiError(StreamError::Validation(e.body_text())))?;
            Ok(Self(body))
        } else {
            let Json(body) = Json::<GenerationRequest>::from_request(req, state)
                .await
                .map_err(|e| ApiError(StreamError::Validation(e.body_text())))?;
            Ok(Self(body))
        }
    }
}

/// Error reported before any body bytes were sent.
pub struct ApiError(pub StreamError);

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }
        (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], self.0.to_string()).into_response()
    }
}
