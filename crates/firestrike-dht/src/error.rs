//! DHT error types

use thiserror::Error;

/// DHT-specific errors
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt store index: {0}")]
    CorruptIndex(String),

    #[error("Invalid content id: {0}")]
    InvalidContentId(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

impl From<bincode::Error> for DhtError {
    fn from(e: bincode::Error) -> Self {
        DhtError::Serialization(e.to_string())
    }
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;
