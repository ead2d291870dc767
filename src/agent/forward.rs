//! Local port forwarding to remote hidden services
//!
//! Each import listens on a local port. Every accepted connection is dialed
//! through tor's SOCKS port to the remote's onion address and relayed in
//! both directions until each side has finished. Failures on one connection
//! are logged and never reach the listener or other connections.

use super::error::AgentError;
use super::socks;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Keep-alive period for both legs of a relayed connection
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// One remote import: `local_addr:local_port` -> `remote_addr:remote_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarder {
    pub remote_addr: String,
    pub remote_port: u16,
    pub local_addr: String,
    pub local_port: u16,
    /// Tor's SOCKS port
    pub socks_addr: String,
}

/// A started forwarder; dropping it leaves the listener running
pub struct ForwarderHandle {
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    /// Close the listener; relays already in flight run to completion
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Forwarder {
    fn target(&self) -> String {
        format!("{}:{}", self.remote_addr, self.remote_port)
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(self) -> Result<ForwarderHandle, AgentError> {
        let bind_addr = join_host_port(&self.local_addr, self.local_port);
        let listener = TcpListener::bind((self.local_addr.as_str(), self.local_port))
            .await
            .map_err(|source| AgentError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| AgentError::Bind {
            addr: bind_addr,
            source,
        })?;

        info!("Forwarding {} -> {}", local_addr, self.target());
        let task = tokio::spawn(self.accept_loop(listener));
        Ok(ForwarderHandle { local_addr, task })
    }

    async fn accept_loop(self, listener: TcpListener) {
        let forwarder = Arc::new(self);
        let connection_count = AtomicU64::new(0);

        loop {
            match listener.accept().await {
                Ok((client, addr)) => {
                    let count = connection_count.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("Session #{}: connection from {}", count, addr);
                    let forwarder = Arc::clone(&forwarder);
                    tokio::spawn(async move {
                        if let Err(e) = forwarder.handle_connection(client).await {
                            warn!("Session #{}: {}", count, e);
                        }
                    });
                },
                Err(e) => {
                    error!("Listener for {} exiting: {}", forwarder.target(), e);
                    return;
                },
            }
        }
    }

    async fn handle_connection(&self, client: TcpStream) -> Result<(), AgentError> {
        set_keepalive(&client);

        let target = self.target();
        debug!("Dialing {} via {}", target, self.socks_addr);
        let remote = socks::connect(&self.socks_addr, &self.remote_addr, self.remote_port)
            .await
            .map_err(|source| AgentError::Dial {
                target: target.clone(),
                source,
            })?;
        set_keepalive(&remote);

        relay(client, remote, &target).await;
        Ok(())
    }
}

/// `host:port`, bracketing IPv6 literals
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Copy both directions concurrently, half-closing each destination when
/// its source is exhausted
pub async fn relay(client: TcpStream, remote: TcpStream, label: &str) {
    let peer = client
        .peer_addr()
        .map_or_else(|_| "client".to_string(), |a| a.to_string());
    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();

    let (upstream, downstream) = tokio::join!(
        pipe(client_read, remote_write),
        pipe(remote_read, client_write),
    );

    log_copy(&peer, label, upstream);
    log_copy(label, &peer, downstream);
}

async fn pipe(mut from: OwnedReadHalf, mut to: OwnedWriteHalf) -> io::Result<u64> {
    let copied = tokio::io::copy(&mut from, &mut to).await;
    let _ = to.shutdown().await;
    copied
}

fn log_copy(from: &str, to: &str, result: io::Result<u64>) {
    match result {
        Ok(n) => debug!("Copied {} bytes {} -> {}", n, from, to),
        Err(e) => debug!("Copy {} -> {} ended: {}", from, to, e),
    }
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_PERIOD)
        .with_interval(KEEPALIVE_PERIOD);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("Failed to set keep-alive: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let forwarder = Forwarder {
            remote_addr: "example.onion".to_string(),
            remote_port: 22,
            local_addr: "127.0.0.1".to_string(),
            local_port: port,
            socks_addr: "127.0.0.1:9".to_string(),
        };
        assert!(matches!(
            forwarder.start().await,
            Err(AgentError::Bind { .. })
        ));
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("127.0.0.1", 2222), "127.0.0.1:2222");
        assert_eq!(join_host_port("::1", 2222), "[::1]:2222");
        assert_eq!(join_host_port("localhost", 80), "localhost:80");
    }

    #[tokio::test]
    async fn test_binds_bare_ipv6_literal() {
        // Hosts without IPv6 loopback cannot run this
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            return;
        }
        let handle = Forwarder {
            remote_addr: "example.onion".to_string(),
            remote_port: 22,
            local_addr: "::1".to_string(),
            local_port: 0,
            socks_addr: "127.0.0.1:9".to_string(),
        }
        .start()
        .await
        .unwrap();
        assert!(handle.local_addr.is_ipv6());
        handle.stop();
    }

    #[tokio::test]
    async fn test_keepalive_uses_fixed_period() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        set_keepalive(&stream);

        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());
        #[cfg(target_os = "linux")]
        {
            assert_eq!(sock.keepalive_time().unwrap(), KEEPALIVE_PERIOD);
            assert_eq!(sock.keepalive_interval().unwrap(), KEEPALIVE_PERIOD);
        }
    }

    #[tokio::test]
    async fn test_unreachable_proxy_keeps_listener_alive() {
        // Reserve a port with nothing listening for the proxy
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let handle = Forwarder {
            remote_addr: "example.onion".to_string(),
            remote_port: 22,
            local_addr: "127.0.0.1".to_string(),
            local_port: 0,
            socks_addr,
        }
        .start()
        .await
        .unwrap();

        for _ in 0..2 {
            let mut client = TcpStream::connect(handle.local_addr).await.unwrap();
            let mut buf = [0u8; 1];
            // Dial fails, the session is dropped and the client sees EOF
            let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf)
                .await
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        handle.stop();
    }
}
