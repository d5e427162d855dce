//! stdteed client implementation
//!
//! Attaches to the daemon and hands every forwarded chunk to a callback.

use crate::daemon::protocol::{read_message, write_message, Attach, Chunk, Job, Message};
use crate::stream::StdStream;
use anyhow::{anyhow, Result};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Client for connecting to the stdtee daemon
pub struct DaemonClient {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
    message_id: u32,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: None,
            message_id: 0,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if daemon is running
    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists() && UnixStream::connect(&self.socket_path).is_ok()
    }

    /// Connect to the daemon
    pub fn connect(&mut self) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| anyhow!("Failed to connect to daemon at {}: {}", self.socket_path.display(), e))?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Attach and stream daemon output into `on_chunk`.
    ///
    /// With a job, returns `Some(exit_code)` once the daemon reports it
    /// finished. Without one, follows until the daemon hangs up and returns
    /// `None`.
    pub fn attach<F>(
        &mut self,
        client_id: &str,
        streams: &[StdStream],
        job: Option<Job>,
        mut on_chunk: F,
    ) -> Result<Option<i32>>
    where
        F: FnMut(&Chunk) -> io::Result<()>,
    {
        if self.stream.is_none() {
            self.connect()?;
        }

        let msg_id = self.next_message_id();
        let stream = self.stream.as_mut().ok_or_else(|| anyhow!("Not connected"))?;

        let attach = Message::Attach(Attach {
            client_id: client_id.to_string(),
            streams: streams.to_vec(),
            job,
        });
        write_message(stream, &attach, msg_id)
            .map_err(|e| anyhow!("Failed to send attach: {}", e))?;

        loop {
            let (message, _id) = match read_message(stream) {
                Ok(result) => result,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(anyhow!("Failed to read from daemon: {}", e)),
            };

            match message {
                Message::AttachAck(_) => {}
                Message::Chunk(chunk) => {
                    on_chunk(&chunk).map_err(|e| anyhow!("Failed to write {} output: {}", chunk.stream, e))?;
                }
                Message::JobFinished(finished) => return Ok(Some(finished.exit_code)),
                Message::Error(error) => return Err(anyhow!("Daemon error: {}", error.message)),
                other => return Err(anyhow!("Unexpected message from daemon: {:?}", other)),
            }
        }
    }

    fn next_message_id(&mut self) -> u32 {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }
}
