//! Same-origin relay between the chat front end and the inference service.

pub mod client;
pub mod server;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

pub const CHAT_PATH: &str = "/api/chat";

/// Body accepted by `POST /api/chat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Body sent to the upstream `/predict` endpoint.
#[derive(Debug, Serialize)]
pub struct PredictRequest<'a> {
    pub text: &'a str,
    pub stream: bool,
}

/// The part of a buffered upstream reply the front end cares about. The relay
/// itself passes the whole JSON document through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub prediction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),
    #[error("{1}")]
    Rejected(StatusCode, String),
    #[error("Upstream error: {}", .0.as_u16())]
    Upstream(StatusCode),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Rejected(status, _) | RelayError::Upstream(status) => *status,
            RelayError::Internal(e) => {
                error!("Relay error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
