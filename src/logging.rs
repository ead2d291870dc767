//! Logging configuration
//!
//! Structured logging with tracing. `RUST_LOG` overrides the default
//! filter; tor's own output is logged under the `tor` target.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Default filter: info, or debug when verbose
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("ormesh={level},tor={level}")
}

/// Initialize logging with environment-based filtering
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
