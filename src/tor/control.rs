//! Tor Control Port client
//!
//! Communicates with the local Tor daemon via the control protocol.
//!
//! A connection has exactly one reader. Commands are strictly
//! request-then-reply: `send` does not return until the synchronous reply
//! has been read, so callers sharing a connection must serialize their
//! calls. Asynchronous replies (status 650) read while waiting are pushed
//! onto the event channel returned by [`ControlConnection::new`]; a consumer
//! (normally [`super::events::Demux::serve`]) must drain that channel
//! whenever events can arrive, otherwise the reader stalls once it fills up.

use super::error::ControlError;
use super::protocol;
use super::reply::{self, Reply};
use std::fmt::Write as _;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered asynchronous replies before the reader blocks on the consumer
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

pub const SIGNAL_RELOAD: &str = "RELOAD";
pub const SIGNAL_SHUTDOWN: &str = "SHUTDOWN";
pub const SIGNAL_DUMP: &str = "DUMP";
pub const SIGNAL_DEBUG: &str = "DEBUG";
pub const SIGNAL_HALT: &str = "HALT";
pub const SIGNAL_CLEAR_DNS_CACHE: &str = "CLEARDNSCACHE";
pub const SIGNAL_NEWNYM: &str = "NEWNYM";
pub const SIGNAL_HEARTBEAT: &str = "HEARTBEAT";

/// A command sent to the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub keyword: String,
    /// Empty arguments are skipped on the wire
    pub arguments: Vec<String>,
    /// Dot-encoded after the command line; requires a `+` keyword
    pub data: Option<String>,
}

impl Command {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn args<I, A>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Serialize to wire format, validating before anything is written
    pub fn encode(&self) -> Result<String, ControlError> {
        if self.keyword.is_empty() {
            return Err(ControlError::EmptyKeyword);
        }
        let data = self.data.as_deref().filter(|d| !d.is_empty());
        if data.is_some() && !self.keyword.starts_with('+') {
            return Err(ControlError::DataWithoutMarker {
                keyword: self.keyword.clone(),
            });
        }

        let mut wire = self.keyword.clone();
        for argument in self.arguments.iter().filter(|a| !a.is_empty()) {
            let _ = write!(wire, " {}", argument);
        }
        wire.push_str("\r\n");
        if let Some(data) = data {
            wire.push_str(&protocol::encode_dot_data(data));
        }
        Ok(wire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unauthenticated,
    Authenticated,
    Rejected,
}

/// Connection to a Tor control port
pub struct ControlConnection<S> {
    stream: BufReader<S>,
    events: mpsc::Sender<Reply>,
    state: AuthState,
}

impl ControlConnection<TcpStream> {
    /// Dial a TCP control port
    pub async fn dial<A>(addr: A) -> io::Result<(Self, mpsc::Receiver<Reply>)>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> ControlConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport; the receiver yields asynchronous replies
    pub fn new(stream: S) -> (Self, mpsc::Receiver<Reply>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let conn = Self {
            stream: BufReader::new(stream),
            events,
            state: AuthState::Unauthenticated,
        };
        (conn, rx)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Send a command and wait for its synchronous reply
    pub async fn send(&mut self, cmd: &Command) -> Result<Reply, ControlError> {
        if self.state == AuthState::Rejected {
            return Err(ControlError::Rejected);
        }
        let wire = cmd.encode()?;
        debug!("Sending Tor command: {}", cmd.keyword);

        self.stream.write_all(wire.as_bytes()).await?;
        self.stream.flush().await?;

        let reply = self.receive_sync().await?;
        debug!("{} -> {} {}", cmd.keyword, reply.status, reply.text);
        Ok(reply)
    }

    /// Read a single reply, synchronous or not
    pub async fn receive(&mut self) -> Result<Reply, ControlError> {
        reply::read_reply(&mut self.stream).await
    }

    /// Read replies until a synchronous one arrives
    ///
    /// Asynchronous replies read on the way are handed to the event channel,
    /// in receipt order, blocking while the channel is full.
    pub async fn receive_sync(&mut self) -> Result<Reply, ControlError> {
        loop {
            let reply = self.receive().await?;
            if reply.is_sync() {
                return Ok(reply);
            }
            if let Err(mpsc::error::SendError(event)) = self.events.send(reply).await {
                warn!("No event consumer, dropping asynchronous reply: {}", event.text);
            }
        }
    }

    /// Authenticate with a control password (HashedControlPassword)
    pub async fn authenticate_password(&mut self, password: &str) -> Result<(), ControlError> {
        let cmd = Command::new("AUTHENTICATE").arg(quote(password));
        self.authenticate(&cmd).await
    }

    /// Authenticate with the contents of the control auth cookie
    pub async fn authenticate_cookie(&mut self, cookie: &[u8]) -> Result<(), ControlError> {
        let cmd = Command::new("AUTHENTICATE").arg(hex::encode(cookie));
        self.authenticate(&cmd).await
    }

    async fn authenticate(&mut self, cmd: &Command) -> Result<(), ControlError> {
        let reply = match self.send(cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state = AuthState::Rejected;
                return Err(e);
            },
        };
        if !reply.is_ok() {
            self.state = AuthState::Rejected;
            return Err(ControlError::AuthenticationFailed {
                status: reply.status,
                text: reply.text,
            });
        }
        self.state = AuthState::Authenticated;
        debug!("Authenticated to Tor control port");
        Ok(())
    }

    /// Send a command whose only acceptable reply is `250 OK`
    pub async fn expect_ok(&mut self, cmd: &Command) -> Result<Reply, ControlError> {
        let reply = self.send(cmd).await?;
        if !reply.is_ok() {
            return Err(ControlError::CommandFailed {
                command: cmd.keyword.clone(),
                status: reply.status,
                text: reply.text,
            });
        }
        Ok(reply)
    }

    /// GETINFO; values are in the reply's lines
    pub async fn get_info(&mut self, key: &str) -> Result<Reply, ControlError> {
        self.expect_ok(&Command::new("GETINFO").arg(key)).await
    }

    /// Launch a remote hostname lookup; the answer arrives as an ADDRMAP event
    pub async fn resolve(&mut self, addr: &str) -> Result<(), ControlError> {
        self.expect_ok(&Command::new("RESOLVE").arg(addr)).await?;
        Ok(())
    }

    /// Replace the set of subscribed asynchronous events
    pub async fn set_events(&mut self, keys: &[&str]) -> Result<(), ControlError> {
        self.expect_ok(&Command::new("SETEVENTS").args(keys.iter().copied()))
            .await?;
        Ok(())
    }

    pub async fn signal(&mut self, name: &str) -> Result<(), ControlError> {
        self.expect_ok(&Command::new("SIGNAL").arg(name)).await?;
        Ok(())
    }

    /// SETCONF with `Key=Value` arguments
    pub async fn set_conf(&mut self, settings: &[String]) -> Result<(), ControlError> {
        self.expect_ok(&Command::new("SETCONF").args(settings.iter().cloned()))
            .await?;
        Ok(())
    }

    /// RESETCONF, clearing each named option
    pub async fn reset_conf(&mut self, keys: &[&str]) -> Result<(), ControlError> {
        self.expect_ok(&Command::new("RESETCONF").args(keys.iter().copied()))
            .await?;
        Ok(())
    }

    /// Persist the running configuration to the daemon's torrc
    pub async fn save_conf(&mut self) -> Result<(), ControlError> {
        self.expect_ok(&Command::new("SAVECONF")).await?;
        Ok(())
    }
}

/// Double-quote a string, escaping quotes and backslashes
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tor::reply::ReplyLine;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    async fn scripted(replies: &str) -> (ControlConnection<DuplexStream>, mpsc::Receiver<Reply>, DuplexStream) {
        let (client, mut server) = duplex(64 * 1024);
        server.write_all(replies.as_bytes()).await.unwrap();
        let (conn, rx) = ControlConnection::new(client);
        (conn, rx, server)
    }

    async fn written(conn: ControlConnection<DuplexStream>, mut server: DuplexStream) -> String {
        drop(conn);
        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_send_receive_session() {
        let replies = "250 OK\r\n\
            510 Unrecognized command \"XXX\"\r\n\
            250-127.192.10.10=torproject.org\r\n\
            250 1.2.3.4=tor.freehaven.net\r\n\
            250+desc/name/moria=\r\n\
            router moria1 128.31.0.34 9101 0 9131\r\n\
            ..  dot escaped by another dot\r\n\
            uptime 1130120\r\n\
            .\r\n\
            250-version=Tor 0.1.1.0-alpha-cvs\r\n\
            250 OK\r\n";
        let (mut conn, _rx, server) = scripted(replies).await;

        conn.authenticate_password("password").await.unwrap();
        assert!(conn.is_authenticated());

        let reply = conn.send(&Command::new("XXX")).await.unwrap();
        assert_eq!(reply.status, 510);
        assert_eq!(reply.text, "Unrecognized command \"XXX\"");
        assert!(reply.lines.is_empty());

        let reply = conn
            .send(
                &Command::new("MAPADDRESS")
                    .arg("0.0.0.0=torproject.org")
                    .arg("")
                    .arg("1.2.3.4=tor.freehaven.net"),
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "1.2.3.4=tor.freehaven.net");
        assert_eq!(
            reply.lines,
            vec![ReplyLine::new(250, "127.192.10.10=torproject.org")]
        );

        let reply = conn.get_info("version desc/name/moria1").await.unwrap();
        assert_eq!(reply.lines.len(), 2);
        assert_eq!(
            reply.lines[0].data.as_deref(),
            Some("router moria1 128.31.0.34 9101 0 9131\n.  dot escaped by another dot\nuptime 1130120\n")
        );
        assert_eq!(reply.lines[1].text, "version=Tor 0.1.1.0-alpha-cvs");

        let sent = written(conn, server).await;
        assert_eq!(
            sent,
            "AUTHENTICATE \"password\"\r\n\
             XXX\r\n\
             MAPADDRESS 0.0.0.0=torproject.org 1.2.3.4=tor.freehaven.net\r\n\
             GETINFO version desc/name/moria1\r\n"
        );
    }

    #[tokio::test]
    async fn test_failed_auth_blocks_further_commands() {
        let (mut conn, _rx, server) =
            scripted("515 Authentication failed: Password did not match\r\n250 OK\r\n").await;

        match conn.authenticate_password("wrong").await {
            Err(ControlError::AuthenticationFailed { status, text }) => {
                assert_eq!(status, 515);
                assert!(text.contains("Password did not match"));
            },
            other => panic!("unexpected auth result: {:?}", other),
        }
        assert!(matches!(
            conn.get_info("version").await,
            Err(ControlError::Rejected)
        ));

        assert_eq!(written(conn, server).await, "AUTHENTICATE \"wrong\"\r\n");
    }

    #[tokio::test]
    async fn test_cookie_auth_is_hex_encoded() {
        let (mut conn, _rx, server) = scripted("250 OK\r\n").await;
        conn.authenticate_cookie(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();
        assert_eq!(written(conn, server).await, "AUTHENTICATE deadbeef\r\n");
    }

    #[tokio::test]
    async fn test_async_replies_go_to_event_channel() {
        let (mut conn, mut rx, _server) =
            scripted("650 CIRC 1000 EXTENDED moria1\r\n650-STREAM 1 NEW\r\n650 OK\r\n250 OK\r\n").await;

        conn.signal(SIGNAL_NEWNYM).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_name(), "CIRC");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.lines, vec![ReplyLine::new(650, "STREAM 1 NEW")]);
    }

    #[tokio::test]
    async fn test_command_failure_carries_reply_text() {
        let (mut conn, _rx, _server) = scripted("552 Unrecognized signal code \"BOGUS\"\r\n").await;
        match conn.signal("BOGUS").await {
            Err(ControlError::CommandFailed {
                command,
                status,
                text,
            }) => {
                assert_eq!(command, "SIGNAL");
                assert_eq!(status, 552);
                assert_eq!(text, "Unrecognized signal code \"BOGUS\"");
            },
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_block_requires_marker() {
        let (mut conn, _rx, server) = scripted("250 OK\r\n").await;

        assert!(matches!(
            conn.send(&Command::new("").arg("x")).await,
            Err(ControlError::EmptyKeyword)
        ));
        assert!(matches!(
            conn.send(&Command::new("POSTDESCRIPTOR").with_data("router x\n")).await,
            Err(ControlError::DataWithoutMarker { .. })
        ));

        let reply = conn
            .send(&Command::new("+POSTDESCRIPTOR").arg("purpose=general").with_data("router x\n.dot\n"))
            .await
            .unwrap();
        assert!(reply.is_ok());

        assert_eq!(
            written(conn, server).await,
            "+POSTDESCRIPTOR purpose=general\r\nrouter x\r\n..dot\r\n.\r\n"
        );
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }
}
