use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced by the HTTP API
#[derive(Error, Debug)]
pub enum ApiError {
    /// Bad or missing input; nothing was written
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Codec, blob or store failure
    #[error("{message}")]
    Internal { message: String, cause: anyhow::Error },
}

/// JSON error envelope
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Internal {
            message: message.into(),
            cause,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::Validation(format!("Invalid multipart upload: {}", e.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Validation(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ApiError::Internal { message, cause } => {
                error!(error = %format!("{cause:#}"), "{}", message);
                ErrorResponse {
                    success: false,
                    error: message.clone(),
                    details: Some(format!("{cause:#}")),
                }
            }
            other => {
                warn!(status = %status, error = %other, "Request rejected");
                ErrorResponse {
                    success: false,
                    error: other.to_string(),
                    details: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
