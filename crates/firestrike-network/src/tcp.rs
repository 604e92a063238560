//! Plain TCP transport

use crate::error::{NetworkError, Result};
use crate::transport::{BoxedStream, Listener, Transport};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// TCP transport
///
/// Offers no anonymity of its own; deployments that need it run nodes
/// behind an overlay that exposes a TCP endpoint.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

/// Bound TCP listener
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
    address: String,
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn Listener>> {
        let bind_addr = format!("{}:{}", host, port);
        let listener =
            TcpListener::bind(&bind_addr)
                .await
                .map_err(|e| NetworkError::BindFailed {
                    address: bind_addr.clone(),
                    reason: e.to_string(),
                })?;

        let local = listener.local_addr()?;
        // Keep the configured host so the address stays what peers dial
        let address = format!("{}:{}", host, local.port());
        info!("TCP transport listening on {}", address);

        Ok(Box::new(TcpTransportListener { listener, address }))
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout(address.to_string()))?
            .map_err(|e| NetworkError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        stream.set_nodelay(true)?;
        debug!("Connected to {}", address);
        Ok(Box::new(stream))
    }
}

#[async_trait::async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> Result<(BoxedStream, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), remote.to_string()))
    }

    fn local_address(&self) -> &str {
        &self.address
    }
}
