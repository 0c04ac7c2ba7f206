use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error kinds surfaced at the API boundary (spec.md §7).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("overloaded")]
    Overloaded,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CoreError::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        match &self {
            CoreError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg.clone()).into_response(),
            CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()).into_response(),
            CoreError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()).into_response(),
            CoreError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response(),
            CoreError::Internal(err) => {
                let correlation_id = uuid::Uuid::new_v4();
                tracing::error!(%correlation_id, error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, correlation_id.to_string()).into_response()
            }
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
