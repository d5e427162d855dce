//! Error types for stream forwarding
//!
//! Only interception setup can fail from a caller's point of view. Write
//! failures on the forwarding path are logged and swallowed, so they have
//! no variant here.

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Errors returned when installing or tearing down an interception
#[derive(Error, Debug)]
pub enum ForwardError {
    /// Could not duplicate the original stream descriptor
    #[error("Can't duplicate original output: {0}")]
    Duplicate(#[source] io::Error),

    /// Pipe allocation failed
    #[error("Can't redirect output: {0}")]
    Pipe(#[source] io::Error),

    /// Pointing the stream at the pipe (or back) failed
    #[error("Can't swap output descriptor: {0}")]
    Redirect(#[source] Errno),

    /// The copy loop thread could not be started
    #[error("Can't start forwarding thread: {0}")]
    Spawn(#[source] io::Error),

    /// The forwarder was closed and no longer accepts consumers
    #[error("Forwarder is closed")]
    Closed,

    /// The copy loop panicked before it could be joined
    #[error("Forwarding thread panicked")]
    CopyLoopPanicked,
}

pub type Result<T> = std::result::Result<T, ForwardError>;
