//! The two conventional process output streams.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::RawFd;

/// A process output stream that can be intercepted and fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    /// Both streams, stdout first
    pub const ALL: [StdStream; 2] = [StdStream::Stdout, StdStream::Stderr];

    /// File descriptor backing this stream
    pub fn fd(self) -> RawFd {
        match self {
            StdStream::Stdout => libc::STDOUT_FILENO,
            StdStream::Stderr => libc::STDERR_FILENO,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_fds() {
        assert_eq!(StdStream::Stdout.fd(), 1);
        assert_eq!(StdStream::Stderr.fd(), 2);
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(StdStream::ALL.map(StdStream::name), ["stdout", "stderr"]);
    }

    #[test]
    fn test_stream_display() {
        assert_eq!(StdStream::Stdout.to_string(), "stdout");
        assert_eq!(StdStream::Stderr.to_string(), "stderr");
    }
}
