//! Tor daemon interaction
//!
//! Speaks the ControlPort line protocol, assembles replies, routes
//! asynchronous events, and runs tor as a child process when we own it.

pub mod control;
pub mod error;
pub mod events;
pub mod process;
pub mod protocol;
pub mod reply;

pub use control::{Command, ControlConnection};
pub use error::{ControlError, ProcessError};
pub use events::{Demux, EventHandler};
pub use process::TorProcess;
pub use reply::{Reply, ReplyLine};
