//! Integration tests for port forwarding through a SOCKS5 proxy
//!
//! A minimal in-test SOCKS5 proxy stands in for tor: it accepts the
//! no-auth CONNECT handshake, records the requested host, and connects to
//! a fixed local backend regardless of the name asked for.

use ormesh::agent::Forwarder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Proxy that routes every CONNECT to `backend`, reporting `host:port`
async fn socks_proxy(backend: SocketAddr) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                client.read_exact(&mut greeting).await.unwrap();
                assert_eq!(greeting, [0x05, 0x01, 0x00]);
                client.write_all(&[0x05, 0x00]).await.unwrap();

                let mut head = [0u8; 5];
                client.read_exact(&mut head).await.unwrap();
                assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
                let mut host = vec![0u8; usize::from(head[4])];
                client.read_exact(&mut host).await.unwrap();
                let port = client.read_u16().await.unwrap();
                let _ = tx.send(format!("{}:{}", String::from_utf8_lossy(&host), port));

                let upstream = TcpStream::connect(backend).await.unwrap();
                client
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                    .await
                    .unwrap();

                let (mut client_read, mut client_write) = client.into_split();
                let (mut upstream_read, mut upstream_write) = upstream.into_split();
                let _ = tokio::join!(
                    async {
                        let _ = tokio::io::copy(&mut client_read, &mut upstream_write).await;
                        let _ = upstream_write.shutdown().await;
                    },
                    async {
                        let _ = tokio::io::copy(&mut upstream_read, &mut client_write).await;
                        let _ = client_write.shutdown().await;
                    },
                );
            });
        }
    });

    (addr, rx)
}

/// Echo server that reports each connection's end-of-input
async fn echo_server() -> (SocketAddr, mpsc::UnboundedReceiver<u64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let copied = tokio::io::copy(&mut read, &mut write).await.unwrap_or(0);
                let _ = write.shutdown().await;
                let _ = tx.send(copied);
            });
        }
    });

    (addr, rx)
}

fn forwarder(socks_addr: String) -> Forwarder {
    Forwarder {
        remote_addr: "remotenode.onion".to_string(),
        remote_port: 7,
        local_addr: "127.0.0.1".to_string(),
        local_port: 0,
        socks_addr,
    }
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_relays_both_directions() {
    let (backend, mut finished) = echo_server().await;
    let (socks_addr, mut requests) = socks_proxy(backend).await;
    let handle = forwarder(socks_addr).start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr).await.unwrap();
    client.write_all(b"hello over tor").await.unwrap();

    let mut buf = [0u8; 14];
    within(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello over tor");
    assert_eq!(within(requests.recv()).await.unwrap(), "remotenode.onion:7");

    // Half-close reaches the backend, whose close comes back as EOF
    client.shutdown().await.unwrap();
    assert_eq!(within(finished.recv()).await.unwrap(), 14);
    let mut rest = Vec::new();
    within(client.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());

    handle.stop();
}

#[tokio::test]
async fn test_remote_close_reaches_client() {
    // Backend that answers once and hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
    });

    let (socks_addr, _requests) = socks_proxy(backend).await;
    let handle = forwarder(socks_addr).start().await.unwrap();

    let mut client = TcpStream::connect(handle.local_addr).await.unwrap();
    let mut received = Vec::new();
    within(client.read_to_end(&mut received)).await.unwrap();
    assert_eq!(received, b"bye");

    handle.stop();
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let (backend, _finished) = echo_server().await;
    let (socks_addr, _requests) = socks_proxy(backend).await;
    let handle = forwarder(socks_addr).start().await.unwrap();

    let mut sessions = Vec::new();
    for i in 0..4u8 {
        let addr = handle.local_addr;
        sessions.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let payload = vec![i; 4096];
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        }));
    }
    for session in sessions {
        within(session).await.unwrap();
    }

    handle.stop();
}
