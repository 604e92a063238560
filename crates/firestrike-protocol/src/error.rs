//! Error types for protocol operations

use thiserror::Error;

use crate::types::ErrorCode;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Payload truncated: got {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("Payload transfer stalled for {0:?}")]
    Stalled(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Wire error code reported back to the peer that sent the bad message
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownType(_) => ErrorCode::UnknownType,
            ProtocolError::MissingField(_) => ErrorCode::MissingField,
            ProtocolError::Malformed(_)
            | ProtocolError::FrameTooLarge { .. }
            | ProtocolError::Truncated { .. }
            | ProtocolError::Serialization(_) => ErrorCode::Malformed,
            ProtocolError::Stalled(_) | ProtocolError::Io(_) => ErrorCode::Internal,
        }
    }
}
