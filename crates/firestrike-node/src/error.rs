//! Node error types

use firestrike_crypto::{ContentId, CryptoError};
use firestrike_dht::DhtError;
use firestrike_network::NetworkError;
use firestrike_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node is not running")]
    NotRunning,

    #[error("Node is already running")]
    AlreadyRunning,

    #[error("Content not found: {0}")]
    NotFound(ContentId),

    #[error("Object {content_id} is {size} bytes (max: {max})")]
    ObjectTooLarge {
        content_id: ContentId,
        size: u64,
        max: u64,
    },

    #[error("File {path} would be a {size}-byte object (max: {max})")]
    FileTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("Peer {address} unreachable: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("Peer {address} rejected request: {reason}")]
    PeerRejected { address: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] DhtError),

    #[error("Transport error: {0}")]
    Transport(#[from] NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
