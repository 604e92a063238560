//! Network error types

use thiserror::Error;

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
