//! Cryptographic error types

use thiserror::Error;

/// Errors raised by the crypto pipeline and link parsing
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid magnet link: {0}")]
    InvalidLink(String),

    #[error("Invalid key length: {actual} bytes (expected {expected})")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid content identifier: {0}")]
    InvalidContentId(String),

    #[error("Crypto library initialization failed")]
    Init,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
