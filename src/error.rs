//! Service-boundary error type.
//!
//! Submission, cancellation and the read endpoints return `TaskError`, which
//! converts to a JSON `{"error": ..}` response. Persistence details are logged
//! and replaced with a generic message.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::StoreError;
use crate::models::task::TaskStatus;
use crate::services::ledger::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task belongs to another owner")]
    Forbidden,

    #[error("task not found")]
    NotFound,

    #[error("task is already {current}")]
    InvalidState { current: TaskStatus },

    /// Cancellation could not be confirmed yet; the client may retry.
    #[error("task is still processing, try again")]
    StillProcessing,

    #[error("insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::Persistence(e.to_string())
    }
}

impl From<JsonRejection> for TaskError {
    fn from(rejection: JsonRejection) -> Self {
        TaskError::Validation(rejection.body_text())
    }
}

impl From<LedgerError> for TaskError {
    fn from(e: LedgerError) -> Self {
        TaskError::Persistence(e.to_string())
    }
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            TaskError::Validation(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
            TaskError::Forbidden => (StatusCode::FORBIDDEN, json!({ "error": self.to_string() })),
            TaskError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": self.to_string() })),
            TaskError::InvalidState { current } => (
                StatusCode::CONFLICT,
                json!({ "error": self.to_string(), "status": current }),
            ),
            TaskError::StillProcessing => (
                StatusCode::CONFLICT,
                json!({ "error": self.to_string(), "retryable": true }),
            ),
            TaskError::InsufficientCredits { balance, cost } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({ "error": "insufficient credits", "balance": balance, "cost": cost }),
            ),
            TaskError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, json!({ "error": self.to_string() }))
            }
            TaskError::Persistence(detail) => {
                tracing::error!(error = %detail, "persistence error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (TaskError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (TaskError::Forbidden, StatusCode::FORBIDDEN),
            (TaskError::NotFound, StatusCode::NOT_FOUND),
            (
                TaskError::InvalidState {
                    current: TaskStatus::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (TaskError::StillProcessing, StatusCode::CONFLICT),
            (
                TaskError::InsufficientCredits { balance: 0, cost: 1 },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (TaskError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                TaskError::Persistence("pool timed out".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
