//! Reply assembly
//!
//! A reply is any number of mid/data lines closed by one end line.

use super::error::ControlError;
use super::protocol::{self, LineKind};
use std::fmt;
use tokio::io::AsyncBufRead;

pub const STATUS_OK: u16 = 250;
pub const STATUS_OPERATION_UNNECESSARY: u16 = 251;
pub const STATUS_RESOURCE_EXHAUSTED: u16 = 451;
pub const STATUS_PROTOCOL_SYNTAX_ERROR: u16 = 500;
pub const STATUS_UNRECOGNIZED_COMMAND: u16 = 510;
pub const STATUS_UNIMPLEMENTED_COMMAND: u16 = 511;
pub const STATUS_ARGUMENT_SYNTAX_ERROR: u16 = 512;
pub const STATUS_UNRECOGNIZED_ARGUMENT: u16 = 513;
pub const STATUS_AUTHENTICATION_REQUIRED: u16 = 514;
pub const STATUS_BAD_AUTHENTICATION: u16 = 515;
pub const STATUS_UNSPECIFIED_ERROR: u16 = 550;
pub const STATUS_INTERNAL_ERROR: u16 = 551;
pub const STATUS_UNRECOGNIZED_ENTITY: u16 = 552;
pub const STATUS_INVALID_CONFIGURATION_VALUE: u16 = 553;
pub const STATUS_INVALID_DESCRIPTOR: u16 = 554;
pub const STATUS_UNMANAGED_ENTITY: u16 = 555;
/// Asynchronous event notification
pub const STATUS_ASYNC_EVENT: u16 = 650;

/// A mid or data line of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    pub text: String,
    /// Unescaped block for data lines, `None` for mid lines
    pub data: Option<String>,
}

impl ReplyLine {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
            data: None,
        }
    }
}

/// A complete reply from the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status of the end line
    pub status: u16,
    /// Text of the end line
    pub text: String,
    /// Every mid/data line before the end line, in receipt order
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Asynchronous event notification (status 650)
    pub fn is_async(&self) -> bool {
        self.status == STATUS_ASYNC_EVENT
    }

    pub fn is_sync(&self) -> bool {
        !self.is_async()
    }

    /// Plain `250 OK`
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK && self.text == "OK"
    }

    /// Event keyword of an asynchronous reply: the text up to the first space
    pub fn event_name(&self) -> &str {
        self.text
            .split_once(' ')
            .map_or(self.text.as_str(), |(event, _)| event)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.text)?;
        for line in &self.lines {
            write!(f, "\n{} {}", line.status, line.text)?;
            if let Some(data) = &line.data {
                write!(f, " {}", data)?;
            }
        }
        Ok(())
    }
}

/// Read lines until an end line and assemble them into one `Reply`
///
/// Any read or syntax failure aborts assembly; no partial reply escapes.
/// Synchronous and asynchronous replies are read the same way.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let raw = protocol::read_line(reader).await?;
        let line = protocol::parse_line(&raw)?;
        match line.kind {
            LineKind::End => {
                return Ok(Reply {
                    status: line.status,
                    text: line.text,
                    lines,
                });
            },
            LineKind::Mid => lines.push(ReplyLine::new(line.status, line.text)),
            LineKind::Data => {
                let data = protocol::read_dot_data(reader).await?;
                lines.push(ReplyLine {
                    status: line.status,
                    text: line.text,
                    data: Some(data),
                });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_mid_then_end() {
        let wire = "250-127.192.10.10=torproject.org\r\n250 1.2.3.4=tor.freehaven.net\r\n";
        let mut reader = BufReader::new(wire.as_bytes());

        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(
            reply,
            Reply {
                status: 250,
                text: "1.2.3.4=tor.freehaven.net".to_string(),
                lines: vec![ReplyLine::new(250, "127.192.10.10=torproject.org")],
            }
        );
    }

    #[tokio::test]
    async fn test_data_line_in_order() {
        let wire = "250+desc/name/moria=\r\nrouter moria1\r\n..dotted\r\n.\r\n\
                    250-version=Tor 0.1.1.0-alpha-cvs\r\n250 OK\r\n";
        let mut reader = BufReader::new(wire.as_bytes());

        let reply = read_reply(&mut reader).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.lines.len(), 2);
        assert_eq!(reply.lines[0].text, "desc/name/moria=");
        assert_eq!(
            reply.lines[0].data.as_deref(),
            Some("router moria1\n.dotted\n")
        );
        assert_eq!(reply.lines[1], ReplyLine::new(250, "version=Tor 0.1.1.0-alpha-cvs"));
    }

    #[tokio::test]
    async fn test_truncated_reply_is_an_error() {
        let mut reader = BufReader::new("250-first\r\n250-second\r\n".as_bytes());
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(ControlError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_bad_line_aborts_reply() {
        let mut reader = BufReader::new("250-first\r\n25\r\n250 OK\r\n".as_bytes());
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(ControlError::Syntax { .. })
        ));
    }

    #[test]
    fn test_async_classification() {
        let event = Reply {
            status: STATUS_ASYNC_EVENT,
            text: "CIRC 1000 EXTENDED moria1,moria2".to_string(),
            lines: Vec::new(),
        };
        assert!(event.is_async());
        assert!(!event.is_sync());
        assert_eq!(event.event_name(), "CIRC");

        let bare = Reply {
            status: STATUS_ASYNC_EVENT,
            text: "HEARTBEAT".to_string(),
            lines: Vec::new(),
        };
        assert_eq!(bare.event_name(), "HEARTBEAT");

        let error = Reply {
            status: STATUS_UNRECOGNIZED_COMMAND,
            text: "Unrecognized command \"XXX\"".to_string(),
            lines: Vec::new(),
        };
        assert!(error.is_sync());
        assert!(!error.is_ok());
    }
}
