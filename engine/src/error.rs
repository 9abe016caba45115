//! Error types for the Ferry engine.

use crate::GlobalId;
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error)]
pub enum Error {
    // Capture/apply errors
    #[error("table not registered: {0}")]
    TableNotRegistered(String),

    #[error("record not found: {table}/{target}")]
    RecordNotFound { table: String, target: GlobalId },

    // Storage failures roll the whole transaction back
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    // Connection-level failures; the synchronizer retries these with
    // backoff, they are never surfaced as data loss
    #[error("transport error: {0}")]
    Transport(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("invalid sync endpoint: {0}")]
    Endpoint(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(Box::new(e))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
