//! Segment Error Types
//!
//! Every failure the membership core surfaces, with its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("Segment already exists: {name}")]
    Conflict { name: String },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Store call timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SegmentError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn segment_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Segment",
            name: name.into(),
        }
    }

    pub fn conflict(name: impl Into<String>) -> Self {
        Self::Conflict { name: name.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Persistence-layer failure (transport, constraint, deadline).
    /// The caller decides whether to retry.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Timeout { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Store(_) => "STORE_ERROR",
            Self::Timeout { .. } => "STORE_TIMEOUT",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SegmentError>;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for SegmentError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
        };

        (self.status_code(), Json(body)).into_response()
    }
}
