//! Object payloads between connections and files

use firestrike_crypto::{ContentHasher, ContentId, Salt};
use firestrike_protocol::{copy_payload, ProtocolError, Result};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};

/// Receive `length` payload bytes into a new file at `path`
///
/// Returns the content id the bytes hash to under `salt`. The file is
/// synced before returning and removed if the transfer fails.
pub(crate) async fn receive_to_file<R>(
    reader: &mut R,
    path: &Path,
    length: u64,
    salt: Salt,
    idle: Duration,
) -> Result<ContentId>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let received = async {
        let mut file = fs::File::create(path).await?;
        let mut hasher = ContentHasher::new(salt);
        copy_payload(reader, &mut file, length, idle, |chunk| hasher.update(chunk)).await?;
        file.sync_all().await?;
        Ok::<_, ProtocolError>(hasher.finalize().0)
    }
    .await;

    if received.is_err() {
        let _ = fs::remove_file(path).await;
    }
    received
}

/// Stream the file at `path` as a payload of `length` bytes
///
/// `length` is what the header already announced to the peer.
pub(crate) async fn send_file<W>(
    writer: &mut W,
    path: &Path,
    length: u64,
    idle: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = fs::File::open(path).await?;
    copy_payload(&mut file, writer, length, idle, |_| {}).await
}
