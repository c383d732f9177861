//! Error types for the song requests domain.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stream_worker::StreamError;
use thiserror::Error;

pub type SongRequestResult<T> = Result<T, SongRequestError>;

#[derive(Debug, Error)]
pub enum SongRequestError {
    #[error("Channel connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Session blob could not be read or written
    #[error("Invalid session data: {0}")]
    Session(String),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Subscription transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Why a channel's preferences refuse a track
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackRejection {
    #[error("explicit tracks are not allowed")]
    Explicit,

    #[error("track is too long ({duration_ms}ms > {max_ms}ms)")]
    TooLong { duration_ms: u64, max_ms: u64 },
}

/// Failures talking to the media player API
#[derive(Debug, Error)]
pub enum PlayerError {
    /// 401, the access token expired or was revoked
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limited")]
    RateLimited,

    #[error("Player API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<redis::RedisError> for SongRequestError {
    fn from(err: redis::RedisError) -> Self {
        SongRequestError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SongRequestError {
    fn from(err: serde_json::Error) -> Self {
        SongRequestError::Session(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SongRequestError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SongRequestError::Transport(err.to_string())
    }
}

impl From<StreamError> for SongRequestError {
    fn from(err: StreamError) -> Self {
        SongRequestError::Queue(err.to_string())
    }
}

impl From<core_config::ConfigError> for SongRequestError {
    fn from(err: core_config::ConfigError) -> Self {
        SongRequestError::Config(err.to_string())
    }
}

/// Store and queue failures are redriven; a missing record never heals on retry
impl From<SongRequestError> for StreamError {
    fn from(err: SongRequestError) -> Self {
        match err {
            SongRequestError::ConnectionNotFound(_) | SongRequestError::Session(_) => {
                StreamError::permanent(err.to_string())
            }
            SongRequestError::Player(PlayerError::RateLimited) => {
                StreamError::rate_limited(err.to_string())
            }
            other => StreamError::transient(other.to_string()),
        }
    }
}

impl IntoResponse for SongRequestError {
    fn into_response(self) -> Response {
        let status = match &self {
            SongRequestError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            SongRequestError::Store(_) | SongRequestError::Queue(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
