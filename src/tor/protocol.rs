//! Control protocol line codec
//!
//! Every reply line is a three digit status, a discriminator and free text,
//! terminated by CRLF:
//!
//! ```text
//! 250-mid line        (more lines follow)
//! 250+data line=      (a dot-encoded block follows)
//! 250 end line        (terminates the reply)
//! ```

use super::error::ControlError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// The three kinds of reply lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `NNN-text`
    Mid,
    /// `NNN+text`, followed by a dot-encoded data block
    Data,
    /// `NNN text`, the last line of a reply
    End,
}

/// A single parsed reply line (without any data block)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub status: u16,
    pub kind: LineKind,
    pub text: String,
}

/// Parse one line with its line ending already removed
pub fn parse_line(line: &str) -> Result<Line, ControlError> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 {
        return Err(ControlError::syntax(line, "line shorter than 4 characters"));
    }

    let kind = match bytes[3] {
        b' ' => LineKind::End,
        b'-' => LineKind::Mid,
        b'+' => LineKind::Data,
        _ => return Err(ControlError::syntax(line, "invalid discriminator")),
    };

    let status = line
        .get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| *code >= 100)
        .ok_or_else(|| ControlError::syntax(line, "invalid status code"))?;

    // Byte 3 is ASCII, so 4 is always a char boundary
    let text = line.get(4..).unwrap_or_default().to_string();

    Ok(Line { status, kind, text })
}

/// Read one line, stripping CRLF (or a bare LF)
///
/// End of stream before any byte is read means the peer hung up.
pub async fn read_line<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ControlError::Closed);
    }
    Ok(trim_line_ending(line))
}

/// Read a dot-encoded block up to (and consuming) the lone `.` line
///
/// Lines are returned LF-terminated with one leading escape dot removed.
/// There is no limit on the number of lines.
pub async fn read_dot_data<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = String::new();
    loop {
        let mut raw = String::new();
        if reader.read_line(&mut raw).await? == 0 {
            return Err(ControlError::UnterminatedData);
        }
        let line = trim_line_ending(raw);
        if line == "." {
            return Ok(data);
        }
        data.push_str(line.strip_prefix('.').unwrap_or(&line));
        data.push('\n');
    }
}

/// Dot-encode a payload for sending after a `+KEYWORD` command line
///
/// The payload is split into lines, each is written CRLF-terminated with a
/// leading dot doubled, and the block is closed with `.\r\n`.
pub fn encode_dot_data(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 8);
    for line in data.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

fn trim_line_ending(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}
