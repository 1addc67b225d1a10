// SPDX-License-Identifier: MIT
// error.rs — API error taxonomy shared by every handler.
//
// Handlers return `ApiError` and let the `IntoResponse` impl translate the
// kind into an HTTP status plus a `{"message": ...}` body. Internal causes
// are logged here and replaced with a generic message so details never leak
// to callers.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// A resource identifier is already taken (e.g. recorder id in use).
    #[error("{0}")]
    Conflict(String),

    #[error("recording already in progress")]
    AlreadyRunning,

    #[error("no recording in progress")]
    NotRunning,

    /// The artifact exists but the operation cannot run while the recording
    /// is still active.
    #[error("recording still in progress, stop it first")]
    InProgress,

    /// Transient: the caller should retry after `retry_after_secs`.
    #[error("recording not ready yet")]
    TryAgainLater { retry_after_secs: u32 },

    #[error("encoder failed to start: {detail}")]
    StartupFailed {
        detail: String,
        exit_code: Option<i32>,
    },

    #[error("invalid zip file: {0}")]
    BadZip(String),

    #[error("devtools upstream not ready")]
    UpstreamNotReady,

    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::NotRunning | ApiError::BadZip(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) | ApiError::AlreadyRunning => StatusCode::CONFLICT,
            ApiError::TryAgainLater { .. } => StatusCode::ACCEPTED,
            ApiError::UpstreamNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InProgress
            | ApiError::StartupFailed { .. }
            | ApiError::Timeout(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal causes go to the log, not the wire.
        let message = match &self {
            ApiError::Internal(cause) => {
                error!(err = %cause, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "message": message }))).into_response();
        if let ApiError::TryAgainLater { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
