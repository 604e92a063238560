//! Outbound requests to peers
//!
//! Each request opens a fresh connection, sends one header frame, reads
//! one header frame and closes. Header exchanges are bounded by one
//! timeout; object payloads are streamed with the same value applied as an
//! idle timeout per chunk. Any transport, framing or timeout failure is
//! reported as `PeerUnreachable` so callers can treat every per-peer
//! failure the same way.

use crate::error::{NodeError, Result};
use crate::transfer::{receive_to_file, send_file};
use firestrike_crypto::{ContentId, Salt};
use firestrike_network::{BoxedStream, Transport};
use firestrike_protocol::{
    read_response, write_request, PeerInfo, ProtocolError, Request, Response,
    DEFAULT_MAX_OBJECT_BYTES,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Answer to a `find` that carried a payload or a referral
#[derive(Debug, Clone, PartialEq)]
pub enum FindReply {
    /// The payload was written to the sink file
    Found {
        salt: Salt,
        size: Option<u64>,
        length: u64,
        /// What the received bytes actually hash to under `salt`
        content_id: ContentId,
    },
    NotFound { peers: Vec<String> },
}

#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    max_frame_bytes: usize,
    max_object_bytes: u64,
}

impl PeerClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, max_frame_bytes: usize) -> Self {
        PeerClient {
            transport,
            timeout,
            max_frame_bytes,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
        }
    }

    /// Refuse `found` payloads larger than `max` bytes
    pub fn with_max_object_bytes(mut self, max: u64) -> Self {
        self.max_object_bytes = max;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(&self, address: &str) -> Result<BoxedStream> {
        self.transport
            .connect(address, self.timeout)
            .await
            .map_err(|e| unreachable_peer(address, e))
    }

    /// Run one step of an exchange under the request timeout
    async fn bounded<T, F>(&self, address: &str, step: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, ProtocolError>>,
    {
        match tokio::time::timeout(self.timeout, step).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(unreachable_peer(address, e)),
            Err(_) => Err(unreachable_peer(
                address,
                format!("no response within {:?}", self.timeout),
            )),
        }
    }

    /// Send one header-only request and wait for its response header
    pub async fn request(&self, address: &str, request: &Request) -> Result<Response> {
        let exchange = async {
            let mut stream = self.connect(address).await?;
            self.bounded(address, async {
                write_request(&mut stream, request).await?;
                read_response(&mut stream, self.max_frame_bytes).await
            })
            .await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => {
                trace!("{} -> {}: {}", request.kind(), address, response.kind());
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(unreachable_peer(
                address,
                format!("no response within {:?}", self.timeout),
            )),
        }
    }

    /// Ping a peer, returning its announced public key
    pub async fn ping(&self, address: &str, sender: &str, public_key: &str) -> Result<String> {
        let request = Request::Ping {
            sender: sender.to_string(),
            public_key: public_key.to_string(),
        };

        match self.request(address, &request).await? {
            Response::Pong { public_key, .. } => Ok(public_key),
            other => Err(rejected(address, &other)),
        }
    }

    /// Ask a peer to store the object in `artifact`
    ///
    /// The file is streamed after the header; it is never read into memory
    /// as a whole.
    pub async fn store(
        &self,
        address: &str,
        hash: ContentId,
        salt: Salt,
        sender: &str,
        size: Option<u64>,
        artifact: &Path,
    ) -> Result<()> {
        let length = tokio::fs::metadata(artifact).await?.len();
        let request = Request::Store {
            hash,
            salt,
            sender: sender.to_string(),
            size,
            length,
        };

        let mut stream = self.connect(address).await?;
        self.bounded(address, write_request(&mut stream, &request)).await?;
        let sent = send_file(&mut stream, artifact, length, self.timeout).await;

        // A peer that refuses the payload answers before closing, so the
        // response is worth reading even when sending failed
        let response = self
            .bounded(address, read_response(&mut stream, self.max_frame_bytes))
            .await;

        match (sent, response) {
            (Ok(()), Ok(Response::Stored { hash: stored })) if stored == hash => {
                trace!("store -> {}: {} bytes", address, length);
                Ok(())
            }
            (_, Ok(other)) => Err(rejected(address, &other)),
            (Err(e), Err(_)) => Err(unreachable_peer(address, e)),
            (Ok(()), Err(e)) => Err(e),
        }
    }

    /// Look up an object on a peer
    ///
    /// A found payload is streamed into `sink` and hashed on the way; the
    /// caller compares the returned content id with the one it asked for.
    pub async fn find(&self, address: &str, hash: ContentId, sink: &Path) -> Result<FindReply> {
        let mut stream = self.connect(address).await?;
        let response = self
            .bounded(address, async {
                write_request(&mut stream, &Request::Find { hash }).await?;
                read_response(&mut stream, self.max_frame_bytes).await
            })
            .await?;

        match response {
            Response::Found {
                hash: found,
                salt,
                size,
                length,
            } if found == hash => {
                if length > self.max_object_bytes {
                    return Err(NodeError::ObjectTooLarge {
                        content_id: hash,
                        size: length,
                        max: self.max_object_bytes,
                    });
                }
                let content_id = receive_to_file(&mut stream, sink, length, salt, self.timeout)
                    .await
                    .map_err(|e| unreachable_peer(address, e))?;
                trace!("find -> {}: {} bytes", address, length);
                Ok(FindReply::Found {
                    salt,
                    size,
                    length,
                    content_id,
                })
            }
            Response::NotFound { peers, .. } => Ok(FindReply::NotFound { peers }),
            other => Err(rejected(address, &other)),
        }
    }

    /// Fetch a peer's directory
    pub async fn get_peers(&self, address: &str, sender: &str) -> Result<Vec<PeerInfo>> {
        let request = Request::GetPeers {
            sender: sender.to_string(),
        };

        match self.request(address, &request).await? {
            Response::Peers { peers } => Ok(peers),
            other => Err(rejected(address, &other)),
        }
    }
}

fn unreachable_peer(address: &str, reason: impl std::fmt::Display) -> NodeError {
    NodeError::PeerUnreachable {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

fn rejected(address: &str, response: &Response) -> NodeError {
    let reason = match response {
        Response::Error { code, message } => format!("{}: {}", code, message),
        other => format!("unexpected {} response", other.kind()),
    };
    NodeError::PeerRejected {
        address: address.to_string(),
        reason,
    }
}
