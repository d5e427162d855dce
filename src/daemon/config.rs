//! Daemon configuration parsing from stdteed.conf
//!
//! Recognized settings:
//! - STDTEE_SOCKET (path of the Unix socket)
//! - STDTEE_LOG (tracing filter, e.g. "info" or "stdtee=debug")
//! - STDTEE_DRAIN_TIMEOUT_MS (how long a finished job waits for its output to be forwarded)
//! - STDTEE_MAX_CLIENTS (concurrent attached clients)
//!
//! Environment variables with the same names override the file.

use crate::config::{parse_assignment, unquote};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const KEYS: [&str; 4] = [
    "STDTEE_SOCKET",
    "STDTEE_LOG",
    "STDTEE_DRAIN_TIMEOUT_MS",
    "STDTEE_MAX_CLIENTS",
];

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Socket path override (None = ~/.stdtee/daemon.sock)
    pub socket_path: Option<PathBuf>,
    /// Tracing filter directive
    pub log_filter: String,
    /// Upper bound on waiting for a finished job's output to be forwarded
    pub drain_timeout: Duration,
    /// Maximum number of concurrently attached clients
    pub max_clients: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            log_filter: "info".to_string(),
            drain_timeout: Duration::from_secs(5),
            max_clients: 64,
        }
    }
}

impl DaemonConfig {
    /// Load ~/.stdtee/stdteed.conf (if any), then apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::config_path()).unwrap_or_default();
        config.apply_env();
        config
    }

    /// Get the path to stdteed.conf
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stdtee")
            .join("stdteed.conf")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = DaemonConfig::default();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.apply(&key, &unquote(&value));
            }
        }

        config
    }

    /// Override settings from the process environment
    pub fn apply_env(&mut self) {
        for key in KEYS {
            if let Ok(value) = env::var(key) {
                self.apply(key, &value);
            }
        }
    }

    /// Apply a single setting; unknown keys and unparsable values are ignored
    pub fn apply(&mut self, key: &str, value: &str) {
        match key {
            "STDTEE_SOCKET" if !value.is_empty() => {
                self.socket_path = Some(PathBuf::from(value));
            }
            "STDTEE_LOG" if !value.is_empty() => {
                self.log_filter = value.to_string();
            }
            "STDTEE_DRAIN_TIMEOUT_MS" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.drain_timeout = Duration::from_millis(ms);
                }
            }
            "STDTEE_MAX_CLIENTS" => {
                if let Ok(n) = value.parse::<usize>() {
                    if n > 0 {
                        self.max_clients = n;
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = DaemonConfig::parse("");
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_parse_all_settings() {
        let content = r#"
STDTEE_SOCKET="/run/stdtee/daemon.sock"
STDTEE_LOG="stdtee=debug"
STDTEE_DRAIN_TIMEOUT_MS=250
STDTEE_MAX_CLIENTS=8
"#;
        let config = DaemonConfig::parse(content);

        assert_eq!(config.socket_path, Some(PathBuf::from("/run/stdtee/daemon.sock")));
        assert_eq!(config.log_filter, "stdtee=debug");
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
        assert_eq!(config.max_clients, 8);
    }

    #[test]
    fn test_parse_with_export_and_comments() {
        let content = r#"
# socket lives in /tmp for this host
export STDTEE_SOCKET='/tmp/stdtee.sock'
# STDTEE_LOG=trace
"#;
        let config = DaemonConfig::parse(content);

        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/stdtee.sock")));
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_parse_bad_values_keep_defaults() {
        let content = r#"
STDTEE_DRAIN_TIMEOUT_MS=soon
STDTEE_MAX_CLIENTS=0
STDTEE_LOG=""
"#;
        let config = DaemonConfig::parse(content);
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdteed.conf");
        fs::write(&path, "STDTEE_MAX_CLIENTS=3\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.max_clients, 3);
        assert!(DaemonConfig::from_file(&dir.path().join("missing.conf")).is_none());
    }
}
