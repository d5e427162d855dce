//! Background thread draining the pipe into the fan-out
//!
//! The pipe's read end is non-blocking. The loop reads until the pipe is
//! empty, then sleeps in `poll` on the pipe and on a private wake pipe. The
//! moment it finds the pipe empty is also when it answers [`Drain`] requests:
//! every byte written before the request has been fanned out by then.

use super::fanout::FanOut;
use crate::config::{MAX_READ_BUFFER_SIZE, MIN_READ_BUFFER_SIZE};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::dup2;
use os_pipe::{PipeReader, PipeWriter};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Why a copy loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyLoopExit {
    /// Every write end was closed
    EndOfStream,
    /// The pipe could not be read; the original stream was put back
    ReadError,
}

#[derive(Default)]
struct DrainProgress {
    /// Highest request answered
    completed: u64,
    /// The loop is gone; nothing more will be answered
    stopped: bool,
}

/// Barrier between writers and the copy loop
pub(crate) struct Drain {
    requested: AtomicU64,
    progress: Mutex<DrainProgress>,
    answered: Condvar,
    wake: PipeWriter,
}

impl Drain {
    /// Block until everything written before this call was fanned out.
    ///
    /// Returns false on timeout or if the loop stopped early.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        // A full wake pipe already guarantees a wakeup
        let _ = (&self.wake).write(&[1]);

        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let (progress, _) = self
            .answered
            .wait_timeout_while(progress, timeout, |p| p.completed < ticket && !p.stopped)
            .unwrap_or_else(PoisonError::into_inner);
        progress.completed >= ticket
    }

    fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    fn complete(&self, upto: u64) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if upto > progress.completed {
            progress.completed = upto;
            self.answered.notify_all();
        }
    }

    fn stop(&self) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.stopped = true;
        self.answered.notify_all();
    }
}

/// Runs when the thread finishes, even on panic
struct LoopGuard {
    live: Arc<AtomicUsize>,
    drain: Arc<Drain>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.drain.stop();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Start the copy loop on its own thread.
///
/// `buffer_size` is clamped to `MIN_READ_BUFFER_SIZE..=MAX_READ_BUFFER_SIZE`
/// and allocated before the thread starts. `live` is incremented before the
/// thread starts and decremented when the loop returns.
pub(crate) fn spawn(
    label: &str,
    target: RawFd,
    reader: PipeReader,
    fanout: FanOut,
    buffer_size: usize,
    live: Arc<AtomicUsize>,
) -> io::Result<(JoinHandle<CopyLoopExit>, Arc<Drain>)> {
    set_nonblocking(reader.as_raw_fd())?;
    let (wake_reader, wake_writer) = os_pipe::pipe()?;
    set_nonblocking(wake_reader.as_raw_fd())?;
    set_nonblocking(wake_writer.as_raw_fd())?;

    let buf = vec![0u8; buffer_size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE)];
    let drain = Arc::new(Drain {
        requested: AtomicU64::new(0),
        progress: Mutex::new(DrainProgress::default()),
        answered: Condvar::new(),
        wake: wake_writer,
    });

    live.fetch_add(1, Ordering::SeqCst);
    let guard = LoopGuard {
        live,
        drain: Arc::clone(&drain),
    };

    let pipes = Pipes {
        data: reader,
        wake: wake_reader,
    };
    let thread_label = label.to_string();
    let handle = thread::Builder::new()
        .name(format!("{}-forwarder", label))
        .spawn(move || {
            let guard = guard;
            run(&thread_label, target, pipes, &fanout, buf, &guard.drain)
        })?;

    Ok((handle, drain))
}

struct Pipes {
    data: PipeReader,
    wake: PipeReader,
}

impl Pipes {
    /// Sleep until the data pipe is readable or someone asks for a drain
    fn wait(&mut self) -> io::Result<()> {
        let mut fds = [
            PollFd::new(self.data.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(errno) => return Err(errno.into()),
        }

        let mut scratch = [0u8; 64];
        loop {
            match self.wake.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn run(
    label: &str,
    target: RawFd,
    mut pipes: Pipes,
    fanout: &FanOut,
    mut buf: Vec<u8>,
    drain: &Drain,
) -> CopyLoopExit {
    loop {
        // Requests seen before an empty read are satisfied by it
        let seen = drain.requested();

        let error = match pipes.data.read(&mut buf) {
            Ok(0) => {
                debug!(stream = label, "Forwarding pipe closed");
                drain.complete(u64::MAX);
                return CopyLoopExit::EndOfStream;
            }
            Ok(n) => {
                // FanOut::write logs its own failures and never errors
                let _ = fanout.write(&buf[..n]);
                continue;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                drain.complete(seen);
                match pipes.wait() {
                    Ok(()) => continue,
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        warn!(stream = label, error = %error, "Forwarding some messages failed");
        // Nobody drains the pipe any more: hand the stream back to its
        // original destination so producers don't block.
        if let Err(errno) = dup2(fanout.original().as_raw_fd(), target) {
            warn!(stream = label, error = %errno, "Failed to restore original output");
        }
        return CopyLoopExit::ReadError;
    }
}

#[cfg(test)]
mod tests {
    use super::super::registry::test_support::SharedBuf;
    use super::super::registry::Registry;
    use super::*;
    use std::sync::Mutex;

    fn start(
        buffer_size: usize,
    ) -> (PipeWriter, SharedBuf, Arc<AtomicUsize>, JoinHandle<CopyLoopExit>, Arc<Drain>) {
        let (reader, writer) = os_pipe::pipe().unwrap();
        let original = tempfile::tempfile().unwrap();
        let registry = Arc::new(Registry::new());
        let consumer = SharedBuf::default();
        registry.insert("c", Box::new(Mutex::new(consumer.clone())));

        let live = Arc::new(AtomicUsize::new(0));
        let target = original.as_raw_fd();
        let fanout = FanOut::new("loop-test", original, registry);
        let (handle, drain) =
            spawn("loop-test", target, reader, fanout, buffer_size, live.clone()).unwrap();
        (writer, consumer, live, handle, drain)
    }

    #[test]
    fn test_loop_forwards_until_end_of_stream() {
        let (mut writer, consumer, live, handle, _drain) = start(512);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        writer.write_all(b"first\n").unwrap();
        writer.write_all(&[b'x'; 2000]).unwrap();
        drop(writer);

        assert_eq!(handle.join().unwrap(), CopyLoopExit::EndOfStream);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        let got = consumer.contents();
        assert_eq!(got.len(), 6 + 2000);
        assert!(got.starts_with(b"first\n"));
        assert!(got[6..].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn test_oversized_buffer_is_clamped() {
        let (mut writer, consumer, _live, handle, _drain) = start(usize::MAX);

        writer.write_all(b"still forwarded\n").unwrap();
        drop(writer);

        assert_eq!(handle.join().unwrap(), CopyLoopExit::EndOfStream);
        assert_eq!(consumer.contents(), b"still forwarded\n");
    }

    #[test]
    fn test_drain_waits_for_pending_bytes() {
        let (mut writer, consumer, _live, handle, drain) = start(512);

        let mut expected = Vec::new();
        for i in 0..200 {
            let line = format!("row {}\n", i);
            writer.write_all(line.as_bytes()).unwrap();
            expected.extend_from_slice(line.as_bytes());
        }

        assert!(drain.wait(Duration::from_secs(5)));
        assert_eq!(consumer.contents(), expected);

        drop(writer);
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_after_loop_stopped() {
        let (writer, _consumer, _live, handle, drain) = start(512);
        drop(writer);
        handle.join().unwrap();

        // Everything was forwarded before end of stream
        assert!(drain.wait(Duration::from_millis(100)));
    }
}
