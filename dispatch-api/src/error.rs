use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use dispatch_core::DispatchError;
use serde::Serialize;
use tracing;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl From<&DispatchError> for ErrorBody {
    fn from(err: &DispatchError) -> Self {
        let message = match err {
            // Storage details stay in the logs.
            DispatchError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            error: err.kind(),
            message,
        }
    }
}

pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        e if e.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::NotRetryable { .. } | DispatchError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A [`DispatchError`] rendered as `{error, message}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}
