//! Logging configuration and initialization
//!
//! Diagnostics are written to stderr's original destination, never through
//! the stderr fan-out. Otherwise a failing stderr consumer would produce a
//! warning, which would be forwarded to the same consumer, fail again, and
//! so on forever.

use crate::forward::original_writer;
use crate::stream::StdStream;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `filter` uses `EnvFilter` syntax ("info", "stdtee=debug", ...). An
/// invalid filter falls back to "info". Calling this twice is harmless; the
/// second subscriber is ignored.
pub fn init(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(|| original_writer(StdStream::Stderr))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        debug!(filter, "Logging initialized");
    }
}
