//! Error responses for the HTTP API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use drip_engine::EngineError;
use drip_scheduler::SchedulerError;
use drip_store::StoreError;

/// An HTTP-ready error: a status code plus a client-safe message.
///
/// Validation and lookup failures keep their message; anything internal is
/// logged here and reaches the client as a generic 500.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::CampaignNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            SchedulerError::Engine(err @ EngineError::InvalidScheduleConfig(_)) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            SchedulerError::Engine(err @ EngineError::NoSendWindowAvailable(_)) => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            SchedulerError::Store(err @ StoreError::Conflict(_)) => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            err => {
                error!(error = %err, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
