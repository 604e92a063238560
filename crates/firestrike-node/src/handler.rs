//! Inbound request dispatch
//!
//! One connection carries one request. The handler reads its header,
//! applies its effect to the shared directory and store, writes one
//! response and closes. `store` payloads are streamed straight into the
//! store's staging area and `found` payloads straight out of the artifact
//! file. Malformed input is answered with an `error` response; it never
//! takes the node down.

use crate::transfer::{receive_to_file, send_file};
use firestrike_crypto::{ContentId, Salt};
use firestrike_dht::{now, ContentStore, ObserveOutcome, PeerDirectory};
use firestrike_network::BoxedStream;
use firestrike_protocol::{
    read_frame, write_response, ErrorCode, PeerInfo, ProtocolError, Request, Response,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// State shared by every connection handler
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub store: Arc<ContentStore>,
    pub directory: Arc<RwLock<PeerDirectory>>,
    pub local_address: String,
    /// Hex-encoded node public key
    pub public_key: String,
    pub max_frame_bytes: usize,
    /// Largest `store` payload accepted
    pub max_object_bytes: u64,
    /// Bound on reading the request header and writing the response
    /// header; also the idle bound while a payload is streaming
    pub io_timeout: Duration,
}

/// Header of a `store` request whose payload is still on the stream
pub(crate) struct StoreHeader {
    pub hash: ContentId,
    pub salt: Salt,
    pub sender: String,
    pub size: Option<u64>,
    pub length: u64,
}

/// Serve one inbound connection
pub(crate) async fn serve_connection(ctx: &HandlerContext, mut stream: BoxedStream, remote: &str) {
    let header = read_frame(&mut stream, ctx.max_frame_bytes);
    let body = match tokio::time::timeout(ctx.io_timeout, header).await {
        Ok(Ok(body)) => body,
        Ok(Err(ProtocolError::Io(e))) => {
            debug!("Connection from {} closed before a request: {}", remote, e);
            return;
        }
        Ok(Err(e)) => {
            warn!("Bad frame from {}: {}", remote, e);
            respond(ctx, &mut stream, remote, &Response::from_error(&e)).await;
            return;
        }
        Err(_) => {
            debug!("Timed out waiting for a request from {}", remote);
            return;
        }
    };

    let request = match Request::decode(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected message from {}: {}", remote, e);
            respond(ctx, &mut stream, remote, &Response::from_error(&e)).await;
            return;
        }
    };
    debug!("{} request from {}", request.kind(), remote);

    match request {
        Request::Ping { sender, public_key } => {
            let response = ping(ctx, &sender, &public_key).await;
            respond(ctx, &mut stream, remote, &response).await;
        }
        Request::Store {
            hash,
            salt,
            sender,
            size,
            length,
        } => {
            let header = StoreHeader {
                hash,
                salt,
                sender,
                size,
                length,
            };
            let response = accept_store(ctx, &mut stream, header).await;
            respond(ctx, &mut stream, remote, &response).await;
        }
        Request::Find { hash } => serve_find(ctx, &mut stream, remote, hash).await,
        Request::GetPeers { sender } => {
            let response = get_peers(ctx, &sender).await;
            respond(ctx, &mut stream, remote, &response).await;
        }
    }
}

/// Write a response header, reporting whether it went out
async fn respond<S>(ctx: &HandlerContext, stream: &mut S, remote: &str, response: &Response) -> bool
where
    S: AsyncWrite + Unpin + ?Sized,
{
    match tokio::time::timeout(ctx.io_timeout, write_response(stream, response)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Failed to answer {}: {}", remote, e);
            false
        }
        Err(_) => {
            debug!("Timed out answering {}", remote);
            false
        }
    }
}

pub(crate) async fn ping(ctx: &HandlerContext, sender: &str, public_key: &str) -> Response {
    let outcome = ctx.directory.write().await.observe(sender, public_key);
    if outcome == ObserveOutcome::Inserted {
        debug!("Learned peer {} from ping", sender);
    }
    Response::Pong {
        address: ctx.local_address.clone(),
        public_key: ctx.public_key.clone(),
    }
}

/// Receive a `store` payload, verify it and commit it
pub(crate) async fn accept_store<S>(
    ctx: &HandlerContext,
    stream: &mut S,
    header: StoreHeader,
) -> Response
where
    S: AsyncRead + Unpin + ?Sized,
{
    let StoreHeader {
        hash,
        salt,
        sender,
        size,
        length,
    } = header;

    if length > ctx.max_object_bytes {
        warn!(
            "Store from {} rejected: {} bytes exceeds limit of {}",
            sender, length, ctx.max_object_bytes
        );
        return Response::Error {
            code: ErrorCode::TooLarge,
            message: format!(
                "object of {} bytes exceeds limit of {} bytes",
                length, ctx.max_object_bytes
            ),
        };
    }

    let staged = ctx.store.staging_path();
    let received = match receive_to_file(stream, &staged, length, salt, ctx.io_timeout).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Store from {} failed while receiving: {}", sender, e);
            return Response::from_error(&e);
        }
    };

    if received != hash {
        let _ = tokio::fs::remove_file(&staged).await;
        warn!("Store from {} rejected: content id does not match payload", sender);
        return Response::Error {
            code: ErrorCode::HashMismatch,
            message: format!("payload does not hash to {}", hash),
        };
    }

    if let Err(e) = ctx.store.put_file(hash, &staged, salt, size).await {
        let _ = tokio::fs::remove_file(&staged).await;
        warn!("Failed to store {}: {}", hash, e);
        return internal_error(e);
    }

    let mut directory = ctx.directory.write().await;
    directory.touch(&sender);
    directory.mark_holds(&sender, hash);
    Response::Stored { hash }
}

/// Answer a `find`, streaming the artifact after a `found` header
pub(crate) async fn serve_find<S>(
    ctx: &HandlerContext,
    stream: &mut S,
    remote: &str,
    hash: ContentId,
) where
    S: AsyncWrite + Unpin + ?Sized,
{
    let located = match ctx.store.entry(&hash).await {
        Some(entry) => {
            let artifact = ctx.store.artifact_path(&hash);
            match tokio::fs::metadata(&artifact).await {
                Ok(meta) => Some((entry, artifact, meta.len())),
                // Removed between the index lookup and here
                Err(e) => {
                    debug!("Artifact for {} vanished: {}", hash, e);
                    None
                }
            }
        }
        None => None,
    };

    let (entry, artifact, length) = match located {
        Some(found) => found,
        None => {
            let response = Response::NotFound {
                hash,
                peers: ctx.directory.read().await.holders_of(&hash),
            };
            respond(ctx, stream, remote, &response).await;
            return;
        }
    };

    let response = Response::Found {
        hash,
        salt: entry.salt,
        size: entry.plaintext_size,
        length,
    };
    if !respond(ctx, stream, remote, &response).await {
        return;
    }

    match send_file(stream, &artifact, length, ctx.io_timeout).await {
        Ok(()) => debug!("Sent {} ({} bytes) to {}", hash, length, remote),
        Err(e) => debug!("Failed to send {} to {}: {}", hash, remote, e),
    }
}

pub(crate) async fn get_peers(ctx: &HandlerContext, sender: &str) -> Response {
    let mut directory = ctx.directory.write().await;
    directory.evict_stale(now());
    let peers = directory
        .snapshot()
        .into_iter()
        .filter(|p| p.peer_id != sender)
        .map(|p| PeerInfo {
            address: p.peer_id,
            public_key: p.public_key,
            shared_files: p.content_ids.into_iter().collect(),
        })
        .collect();
    Response::Peers { peers }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    Response::Error {
        code: ErrorCode::Internal,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firestrike_crypto::hash_content;
    use firestrike_protocol::{read_response, write_request, Status};
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> HandlerContext {
        HandlerContext {
            store: Arc::new(ContentStore::open(dir.path()).await.unwrap()),
            directory: Arc::new(RwLock::new(PeerDirectory::new(10, 300))),
            local_address: "127.0.0.1:8789".to_string(),
            public_key: "ab".repeat(32),
            max_frame_bytes: 1024 * 1024,
            max_object_bytes: 1024 * 1024,
            io_timeout: Duration::from_secs(5),
        }
    }

    fn blob() -> Vec<u8> {
        (0..64u8).collect()
    }

    fn store_header(hash: ContentId, salt: Salt, length: usize) -> StoreHeader {
        StoreHeader {
            hash,
            salt,
            sender: "127.0.0.1:9000".to_string(),
            size: None,
            length: length as u64,
        }
    }

    /// Run `serve_find` into a buffer and split it into header and payload
    async fn find_locally(ctx: &HandlerContext, hash: ContentId) -> (Response, Vec<u8>) {
        let mut out = Vec::new();
        serve_find(ctx, &mut out, "test", hash).await;

        let mut reader = &out[..];
        let response = read_response(&mut reader, 4096).await.unwrap();
        (response, reader.to_vec())
    }

    #[tokio::test]
    async fn test_ping_observes_sender() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        let response = ping(&ctx, "127.0.0.1:9000", &"cd".repeat(32)).await;

        assert_eq!(
            response,
            Response::Pong {
                address: ctx.local_address.clone(),
                public_key: ctx.public_key.clone(),
            }
        );
        assert!(ctx.directory.read().await.contains("127.0.0.1:9000"));
    }

    #[tokio::test]
    async fn test_store_verifies_hash() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let data = blob();
        let (hash, salt) = hash_content(&data, None);

        let wrong = store_header(ContentId::from_bytes([0; 32]), salt, data.len());
        let response = accept_store(&ctx, &mut &data[..], wrong).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::HashMismatch,
                ..
            }
        ));
        assert!(ctx.store.is_empty().await);

        let mut header = store_header(hash, salt, data.len());
        header.size = Some(40);
        let response = accept_store(&ctx, &mut &data[..], header).await;
        assert_eq!(response, Response::Stored { hash });

        let stored = ctx.store.get(&hash).await.unwrap().unwrap();
        assert_eq!(stored.ciphertext, data);
        assert_eq!(stored.plaintext_size, Some(40));
    }

    #[tokio::test]
    async fn test_rejected_store_leaves_no_staged_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let data = blob();
        let (_, salt) = hash_content(&data, None);

        let header = store_header(ContentId::from_bytes([0; 32]), salt, data.len());
        accept_store(&ctx, &mut &data[..], header).await;

        // Short payload: the sender announced more than it sent
        let (hash, salt) = hash_content(&data, None);
        let header = store_header(hash, salt, data.len() + 1);
        let response = accept_store(&ctx, &mut &data[..], header).await;
        assert_eq!(response.status(), Status::Error);

        let staged = std::fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(staged, 0);
        assert!(ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_over_limit_is_refused_unread() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir).await;
        ctx.max_object_bytes = 32;

        let data = blob();
        let (hash, salt) = hash_content(&data, None);
        let mut payload = &data[..];
        let response = accept_store(&ctx, &mut payload, store_header(hash, salt, data.len())).await;

        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::TooLarge,
                ..
            }
        ));
        // Nothing was consumed from the connection
        assert_eq!(payload.len(), data.len());
        assert!(ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_marks_known_sender_as_holder() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        ctx.directory.write().await.observe("127.0.0.1:9000", "pk");

        let data = blob();
        let (hash, salt) = hash_content(&data, None);
        accept_store(&ctx, &mut &data[..], store_header(hash, salt, data.len())).await;

        assert_eq!(
            ctx.directory.read().await.holders_of(&hash),
            vec!["127.0.0.1:9000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_find_found_and_not_found() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let data = blob();
        let (hash, salt) = hash_content(&data, None);

        let (missing, payload) = find_locally(&ctx, hash).await;
        assert_eq!(missing.status(), Status::NotFound);
        assert!(payload.is_empty());

        ctx.store.put(hash, &data, salt, None).await.unwrap();
        let (found, payload) = find_locally(&ctx, hash).await;
        assert_eq!(
            found,
            Response::Found {
                hash,
                salt,
                size: None,
                length: data.len() as u64,
            }
        );
        assert_eq!(payload, data);
    }

    #[tokio::test]
    async fn test_find_miss_returns_holders() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let hash = ContentId::from_bytes([6; 32]);
        {
            let mut directory = ctx.directory.write().await;
            directory.observe("127.0.0.1:9001", "pk");
            directory.observe("127.0.0.1:9002", "pk");
            directory.mark_holds("127.0.0.1:9002", hash);
        }

        let (response, _) = find_locally(&ctx, hash).await;
        assert_eq!(
            response,
            Response::NotFound {
                hash,
                peers: vec!["127.0.0.1:9002".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_get_peers_evicts_stale_first() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let hash = ContentId::from_bytes([8; 32]);
        {
            let mut directory = ctx.directory.write().await;
            directory.observe_at("127.0.0.1:9001", "old", 0);
            directory.observe("127.0.0.1:9002", "fresh");
            directory.mark_holds("127.0.0.1:9002", hash);
        }

        let response = get_peers(&ctx, "127.0.0.1:9003").await;

        assert_eq!(
            response,
            Response::Peers {
                peers: vec![PeerInfo {
                    address: "127.0.0.1:9002".to_string(),
                    public_key: "fresh".to_string(),
                    shared_files: vec![hash],
                }],
            }
        );
        assert!(!ctx.directory.read().await.contains("127.0.0.1:9001"));
    }

    #[tokio::test]
    async fn test_serve_connection_answers_unknown_type() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let (client, server) = tokio::io::duplex(4096);

        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { serve_connection(&ctx, Box::new(server), "test").await })
        };

        let mut client = client;
        firestrike_protocol::write_frame(&mut client, br#"{"type":"gossip"}"#)
            .await
            .unwrap();
        let response = read_response(&mut client, 4096).await.unwrap();

        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::UnknownType,
                ..
            }
        ));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_connection_streams_store_and_find() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        // Larger than the duplex buffer and the header limit, so the payload
        // has to be streamed in pieces on both legs
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 239) as u8).collect();
        let salt = Salt::generate();
        let (hash, _) = hash_content(&data, Some(salt));

        let (mut client, server) = tokio::io::duplex(4096);
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { serve_connection(&ctx, Box::new(server), "test").await })
        };
        let request = Request::Store {
            hash,
            salt,
            sender: "127.0.0.1:9000".to_string(),
            size: None,
            length: data.len() as u64,
        };
        write_request(&mut client, &request).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &data)
            .await
            .unwrap();
        let response = read_response(&mut client, 4096).await.unwrap();
        assert_eq!(response, Response::Stored { hash });
        handle.await.unwrap();
        assert!(ctx.store.contains(&hash).await);

        let (mut client, server) = tokio::io::duplex(4096);
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { serve_connection(&ctx, Box::new(server), "test").await })
        };
        write_request(&mut client, &Request::Find { hash }).await.unwrap();
        let response = read_response(&mut client, 4096).await.unwrap();
        assert_eq!(response.payload_length(), data.len() as u64);

        let mut payload = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut payload)
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(payload, data);
    }
}
