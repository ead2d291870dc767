//! Agent errors

use crate::tor::error::{ControlError, ProcessError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The control port never came up within the retry budget
    #[error("control connect to {addr} failed after {attempts} attempts: {source}")]
    ConnectTimeout {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Command issued before `start` or after `stop`
    #[error("agent is not connected to the control port")]
    NotConnected,

    /// No `# client: <name>` line in the hostname file
    #[error("client {client:?} not found in {path:?}")]
    NotFound { client: String, path: PathBuf },

    #[error("failed to bind forwarder on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to reach {target} through tor: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid export {export:?}: {reason}")]
    InvalidExport { export: String, reason: &'static str },

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
