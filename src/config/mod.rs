//! Configuration for stdtee
//!
//! Forwarder tuning comes from the environment. Daemon settings live in
//! `~/.stdtee/stdteed.conf` and are re-exported here for convenience.

use std::env;

pub use crate::daemon::config::DaemonConfig;

/// Default read buffer for the copy loop (matches a typical pipe capacity)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Smallest read buffer accepted from the environment
pub const MIN_READ_BUFFER_SIZE: usize = 512;

/// Largest read buffer; one read never returns more than a pipe holds
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Tuning for a single forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// Bytes requested per read from the pipe
    pub read_buffer_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ForwarderConfig {
    /// Read tuning from STDTEE_READ_BUFFER, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = env::var("STDTEE_READ_BUFFER") {
            config.apply("STDTEE_READ_BUFFER", &value);
        }
        config
    }

    /// Apply a single `KEY=value` setting, ignoring unknown keys and bad values
    pub fn apply(&mut self, key: &str, value: &str) {
        if key == "STDTEE_READ_BUFFER" {
            if let Ok(size) = value.trim().parse::<usize>() {
                self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
            }
        }
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
pub(crate) fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    // Validate key is a valid identifier
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
pub(crate) fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}
