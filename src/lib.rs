//! ormesh library crate
//!
//! Exposes and consumes TCP services over tor hidden services by driving a
//! local tor daemon through its control port.
//!
//! # Modules
//!
//! - [`tor`] - Control protocol codec, connection, events, tor process
//! - [`agent`] - Daemon supervision and port forwarding
//! - [`config`] - Configuration loading and validation
//! - [`cli`] - Command-line interface (run, access, check)
//! - [`logging`] - Tracing subscriber setup

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod logging;
pub mod tor;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
