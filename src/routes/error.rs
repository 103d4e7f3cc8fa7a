use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::converter::ConvertError;
use crate::services::queue::QueueError;
use crate::store::StoreError;

/// Error type for HTTP handlers, rendered as `{"error", "code"}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing requester identity; authentication happens upstream.
    #[error("Missing X-User-Id header")]
    MissingUser,

    #[error("{0}")]
    NotFound(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Convert(#[from] ConvertError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::MissingUser => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::QueueUnavailable(err) => {
                tracing::error!(error = %err, "Queue unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_UNAVAILABLE",
                    "The job queue is unavailable, try again later".to_string(),
                )
            }
            ApiError::Store(StoreError::JobNotFound(id)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", format!("Job {id} not found"))
            }
            ApiError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            ApiError::Convert(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "CONVERSION_FAILED",
                err.to_string(),
            ),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
