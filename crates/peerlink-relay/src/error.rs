//! Error types for peerlink-relay

use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required field (networkID, peerID, targetPeerID) is missing
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidRequest(_) => ErrorCode::InvalidRequest,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
