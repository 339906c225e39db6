//! Client-side signaling errors

use peerlink_relay::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server error ({code}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling connection closed")]
    Closed,

    #[error("Request timed out")]
    Timeout,

    #[error("Join cancelled")]
    Cancelled,

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalingError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SignalingError::Transport(e.to_string())
    }
}

impl From<peerlink_relay::Error> for SignalingError {
    fn from(e: peerlink_relay::Error) -> Self {
        match e {
            peerlink_relay::Error::InvalidRequest(msg) => SignalingError::InvalidRequest(msg.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalingError>;
