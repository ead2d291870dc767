//! Tor control and process errors

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while talking to the Tor control port
#[derive(Debug, Error)]
pub enum ControlError {
    /// A reply line did not follow the `NNN[ -+]text` grammar
    #[error("protocol syntax error: {reason}: {line:?}")]
    Syntax { line: String, reason: &'static str },

    /// `Command::keyword` was empty
    #[error("empty keyword in command")]
    EmptyKeyword,

    /// Command carried a data block without the leading `+` on its keyword
    #[error("command {keyword} carries data but its keyword lacks a leading '+'")]
    DataWithoutMarker { keyword: String },

    /// The stream ended before the lone `.` closing a data block
    #[error("stream ended inside a data block")]
    UnterminatedData,

    /// The daemon closed the control connection
    #[error("control connection closed by peer")]
    Closed,

    /// AUTHENTICATE was answered with anything but `250 OK`
    #[error("control authentication failed: {status} {text}")]
    AuthenticationFailed { status: u16, text: String },

    /// A previous authentication attempt failed on this connection
    #[error("control connection rejected authentication; no further commands allowed")]
    Rejected,

    /// A command expecting `250 OK` got something else
    #[error("{command} failed: {status} {text}")]
    CommandFailed {
        command: String,
        status: u16,
        text: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ControlError {
    pub(crate) fn syntax(line: &str, reason: &'static str) -> Self {
        Self::Syntax {
            line: line.to_string(),
            reason,
        }
    }
}

/// Errors raised while running the Tor daemon as a child process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {binary:?}: {source}")]
    Launch {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to hash control password with {binary:?}: {reason}")]
    HashPassword { binary: PathBuf, reason: String },

    #[error("tor did not finish bootstrapping within {secs}s")]
    BootTimeout { secs: u64 },

    #[error("tor exited before finishing bootstrap")]
    ExitedDuringBoot,

    #[error("failed to kill tor process: {0}")]
    Kill(#[source] io::Error),

    #[error("failed to wait for tor process exit: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to prepare {path:?}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
