//! Error-to-response mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookrelay_broker::PublishError;
use hookrelay_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Failure of a single request.
#[derive(Debug, Error)]
pub enum AppError {
    /// The caller sent something unusable.
    #[error("{0}")]
    BadRequest(String),

    /// The broker did not take the message.
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    /// The relay could not build the outgoing message.
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Publish(PublishError::InvalidTopic(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Publish(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissingEventType => Self::bad_request("missing or invalid eventType"),
            CoreError::Json(e) => Self::BadRequest(format!("invalid payload: {e}")),
        }
    }
}

/// A message that passed the filter could not be serialized.
pub(crate) fn encode_failure(err: &CoreError) -> AppError {
    AppError::Internal(format!("failed to encode message: {err}"))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            warn!(error = %self, "Rejected request");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}
