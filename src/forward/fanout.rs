//! The fan-out write path: real stream first, then every consumer

use super::registry::Registry;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::warn;

/// Writes each chunk to the original stream and to all registered consumers.
///
/// Only the copy loop calls [`FanOut::write`]; application code keeps
/// writing to the (redirected) stream as usual.
pub struct FanOut {
    label: String,
    original: File,
    registry: Arc<Registry>,
}

impl FanOut {
    pub fn new(label: impl Into<String>, original: File, registry: Arc<Registry>) -> Self {
        Self {
            label: label.into(),
            original,
            registry,
        }
    }

    /// Forward one chunk.
    ///
    /// Returns the number of bytes that reached the original stream. Neither
    /// a failed original write nor a failed consumer is reported as an error.
    pub fn write(&self, chunk: &[u8]) -> io::Result<usize> {
        let written = match (&self.original).write_all(chunk) {
            Ok(()) => chunk.len(),
            Err(e) => {
                warn!(stream = %self.label, error = %e, "Failed to write to regular output");
                0
            }
        };

        self.registry.broadcast(chunk, |id, e| {
            warn!(stream = %self.label, consumer = id, error = %e, "Failed to forward logs");
        });

        Ok(written)
    }

    /// The saved original stream
    pub fn original(&self) -> &File {
        &self.original
    }
}
