use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio::task::JoinError;
use tracing::error;

use parley_types::api::ErrorResponse;
use parley_types::error::ChatError;

/// HTTP face of [`ChatError`].
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<JoinError> for ApiError {
    fn from(err: JoinError) -> Self {
        error!("spawn_blocking join error: {}", err);
        Self(ChatError::Store("worker task failed".into()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Authorization(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Store details stay in the log.
        let message = match &self.0 {
            ChatError::Store(_) => "internal store error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
