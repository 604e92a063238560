//! Transport traits

use crate::error::Result;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to a peer
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased connection
pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport a node listens and dials on
///
/// The address reported by a listener is exactly the string a remote node
/// must pass to [`Transport::connect`] to reach it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Start listening; port 0 picks a free port
    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn Listener>>;

    /// Open a connection, failing if it is not established within `timeout`
    async fn connect(&self, address: &str, timeout: Duration) -> Result<BoxedStream>;
}

/// A bound listener
///
/// Dropping the listener stops accepting connections.
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection
    ///
    /// Returns the stream and a description of the remote end for logging.
    async fn accept(&self) -> Result<(BoxedStream, String)>;

    /// Address remote nodes use to reach this listener
    fn local_address(&self) -> &str;
}
