//! TCP transport tests over loopback

use firestrike_network::{NetworkError, TcpTransport, Transport};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_listen_reports_dialable_address() {
    let transport = TcpTransport::new();
    let listener = transport.listen("127.0.0.1", 0).await.unwrap();

    let address = listener.local_address().to_string();
    assert!(address.starts_with("127.0.0.1:"));
    assert_ne!(address, "127.0.0.1:0");
}

#[tokio::test]
async fn test_connect_and_exchange() {
    let transport = TcpTransport::new();
    let listener = transport.listen("127.0.0.1", 0).await.unwrap();
    let address = listener.local_address().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _remote) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut client = transport.connect(&address, TIMEOUT).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();

    assert_eq!(&echoed, b"ping");
    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused() {
    let transport = TcpTransport::new();

    // Bind then drop to find a port nobody listens on
    let address = {
        let listener = transport.listen("127.0.0.1", 0).await.unwrap();
        listener.local_address().to_string()
    };

    let result = transport.connect(&address, TIMEOUT).await;
    assert!(matches!(result, Err(NetworkError::ConnectFailed { .. })));
}

#[tokio::test]
async fn test_bind_conflict() {
    let transport = TcpTransport::new();
    let first = transport.listen("127.0.0.1", 0).await.unwrap();
    let port: u16 = first
        .local_address()
        .rsplit(':')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    let result = transport.listen("127.0.0.1", port).await;
    assert!(matches!(result, Err(NetworkError::BindFailed { .. })));
}
