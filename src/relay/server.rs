use std::{any::Any, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures::TryStreamExt;
use serde_json::Value;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use super::{ChatRequest, PredictRequest, RelayError, CHAT_PATH};
use crate::config::RelayConfig;

const PREVIEW_CHARS: usize = 50;

// Connection-scoped headers that must not be copied onto the relayed response.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "te",
    "trailer",
    "upgrade",
];

pub struct RelayState {
    pub config: RelayConfig,
    pub http: reqwest::Client,
}

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            state: Arc::new(RelayState { config, http }),
        })
    }

    pub fn router(&self) -> Router {
        let body_limit = match self.state.config.body_limit() {
            Some(bytes) => DefaultBodyLimit::max(bytes),
            None => DefaultBodyLimit::disable(),
        };

        Router::new()
            .route(CHAT_PATH, post(chat_handler).options(preflight_handler))
            .layer(body_limit)
            .with_state(self.state.clone())
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn chat_handler(
    State(state): State<Arc<RelayState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, RelayError> {
    let body = body.map_err(|rejection| {
        warn!("Rejected request body: {}", rejection.body_text());
        RelayError::Rejected(rejection.status(), rejection.body_text())
    })?;

    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::Validation(format!("Invalid request body: {}", e)))?;

    let text = match request.text {
        Some(text) if !text.is_empty() => text,
        _ => return Err(RelayError::Validation("Text is required".to_string())),
    };

    let stream = state.config.streaming && request.stream.unwrap_or(false);

    info!("Proxying request to upstream: {}...", preview(&text));

    let mut upstream = state
        .http
        .post(state.config.predict_url())
        .json(&PredictRequest {
            text: &text,
            stream,
        });
    if !stream {
        upstream = upstream.timeout(state.config.upstream_timeout());
    }

    let response = upstream
        .send()
        .await
        .context("Failed to reach inference service")?;

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    info!("Upstream response content-type: {}", content_type);

    if stream && content_type.contains("text/event-stream") {
        info!("Relaying event stream from upstream");
        return Ok(relay_stream(response));
    }

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        error!("Upstream error: {} {}", status.as_u16(), detail);
        return Err(RelayError::Upstream(status));
    }

    let data: Value = response
        .json()
        .await
        .context("Upstream returned malformed JSON")?;
    info!("Received response from upstream");

    Ok(Json(data).into_response())
}

/// Pipes the upstream body through unbuffered. Dropping the returned body
/// (client went away) drops the upstream response and closes its connection.
fn relay_stream(response: reqwest::Response) -> Response {
    let status = response.status();
    let headers = forwardable_headers(response.headers());

    let chunks = response
        .bytes_stream()
        .inspect_err(|e| warn!("Upstream stream ended with error: {}", e));

    let mut relayed = Response::new(Body::from_stream(chunks));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

fn forwardable_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    RelayError::Internal(anyhow::anyhow!("handler panicked")).into_response()
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
