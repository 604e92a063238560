//! FireStrike Network Layer
//!
//! The transport a node runs over is pluggable: anything that can listen
//! on a stable address, accept inbound connections and dial a remote
//! address within a timeout. Addresses are opaque strings; the node never
//! parses them. A plain TCP transport is provided.

pub mod error;
pub mod tcp;
pub mod transport;

pub use error::{NetworkError, Result};
pub use tcp::{TcpTransport, TcpTransportListener};
pub use transport::{AsyncStream, BoxedStream, Listener, Transport};
