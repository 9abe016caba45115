//! Errors on the relay's HTTP surface.
//!
//! Only what can go wrong before the WebSocket upgrade lives here: bad
//! connect parameters, a failed credential check, or trouble opening the
//! dataset. Once a session is established, transport and apply failures
//! are handled inside the session loop and never surface through HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The dataset store could not be opened or scanned
    #[error("engine error: {0}")]
    Engine(#[from] ferry_engine::Error),

    /// Malformed connect parameters
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Missing or mismatched credential
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Engine(e) => {
                tracing::error!("dataset error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };

        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
