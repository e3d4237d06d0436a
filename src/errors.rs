use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{models::session::SessionStatus, store::StoreError};

/// Typed failures of the upload session authority and completion coordinator.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("content type `{0}` is not accepted")]
    UnsupportedMediaType(String),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("caller is not authorized for this upload")]
    Unauthorized,
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("upload session `{id}` is closed ({status})")]
    SessionClosed { id: Uuid, status: SessionStatus },
    #[error("part number {0} is out of range")]
    InvalidPartNumber(i64),
    #[error("incomplete part set: {0}")]
    IncompletePartSet(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("finalization failed: {0}")]
    FinalizationFailed(String),
    #[error("stored object `{0}` does not match the declared checksum")]
    IntegrityMismatch(String),
    #[error("object `{0}` has not been stored yet")]
    ObjectMissing(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            UploadError::EmptyPayload => "EMPTY_PAYLOAD",
            UploadError::Unauthorized => "UNAUTHORIZED",
            UploadError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            UploadError::SessionClosed { .. } => "SESSION_CLOSED",
            UploadError::InvalidPartNumber(_) => "INVALID_PART_NUMBER",
            UploadError::IncompletePartSet(_) => "INCOMPLETE_PART_SET",
            UploadError::InvalidRequest(_) => "INVALID_REQUEST",
            UploadError::FinalizationFailed(_) => "FINALIZATION_FAILED",
            UploadError::IntegrityMismatch(_) => "INTEGRITY_MISMATCH",
            UploadError::ObjectMissing(_) => "OBJECT_MISSING",
            UploadError::Store(_) => "STORE_ERROR",
            UploadError::Sqlx(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::EmptyPayload
            | UploadError::InvalidPartNumber(_)
            | UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::Unauthorized => StatusCode::FORBIDDEN,
            UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::SessionClosed { .. } => StatusCode::GONE,
            UploadError::IncompletePartSet(_) | UploadError::IntegrityMismatch(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            UploadError::ObjectMissing(_) => StatusCode::CONFLICT,
            UploadError::FinalizationFailed(_) | UploadError::Store(_) => StatusCode::BAD_GATEWAY,
            UploadError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            code: "ERROR",
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL",
            ..Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
        }
    }

    /// Shortcut for 401 Unauthorized (missing or invalid identity)
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self {
            code: "UNAUTHORIZED",
            ..Self::new(StatusCode::UNAUTHORIZED, msg)
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::error!(error = %err, "upload request failed");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::error!(error = %err, "store request failed");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
