//! Process-wide stdout/stderr forwarding
//!
//! A [`Forwarder`] owns one output stream. The first registration swaps the
//! stream's file descriptor for the write end of a pipe and starts a copy
//! loop on the read end. Every chunk the loop reads is written to the
//! original destination, then to every registered consumer.
//!
//! ```text
//!   writers ──► fd 1 (pipe) ──► copy loop ──► FanOut ──┬─► original stdout
//!                                                      ├─► consumer "client-1"
//!                                                      └─► consumer "client-2"
//! ```
//!
//! Anything that duplicated the descriptor before the first registration
//! keeps writing to the original destination and is not forwarded.
//!
//! Consumers are written while the registry is held in shared mode, so a
//! [`Sink`] must never register or unregister from inside `write_chunk`.

pub mod copy_loop;
pub mod fanout;
pub mod registry;

pub use copy_loop::CopyLoopExit;

use copy_loop::Drain;
pub use fanout::FanOut;
pub use registry::{Registry, Sink};

use crate::config::ForwarderConfig;
use crate::error::{ForwardError, Result};
use crate::stream::StdStream;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::dup2;
use os_pipe::PipeWriter;
use std::fs::File;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

static STDOUT_FORWARDER: LazyLock<Forwarder> =
    LazyLock::new(|| Forwarder::new(StdStream::Stdout, ForwarderConfig::from_env()));

static STDERR_FORWARDER: LazyLock<Forwarder> =
    LazyLock::new(|| Forwarder::new(StdStream::Stderr, ForwarderConfig::from_env()));

/// The process-wide forwarder for `stream`
pub fn forwarder(stream: StdStream) -> &'static Forwarder {
    match stream {
        StdStream::Stdout => &STDOUT_FORWARDER,
        StdStream::Stderr => &STDERR_FORWARDER,
    }
}

/// Forward `stream` to `writer` under `id` (and to all previous consumers).
///
/// The first call for a stream intercepts it. Ids are unique per stream:
/// registering an existing id replaces its writer.
pub fn register_consumer<W>(stream: StdStream, id: &str, writer: W) -> Result<()>
where
    W: Write + Send + 'static,
{
    forwarder(stream).register(id, writer)
}

/// Like [`register_consumer`] for a custom [`Sink`]
pub fn register_consumer_sink<S>(stream: StdStream, id: &str, sink: S) -> Result<()>
where
    S: Sink + 'static,
{
    forwarder(stream).register_sink(id, sink)
}

/// Stop forwarding `stream` to `id`. Unknown ids are ignored.
pub fn unregister_consumer(stream: StdStream, id: &str) {
    forwarder(stream).unregister(id)
}

/// Writer to the destination `stream` had before interception
pub fn original_writer(stream: StdStream) -> OriginalWriter<'static> {
    forwarder(stream).original_writer()
}

/// Lifecycle of a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Uninitialized,
    Intercepting,
    Closed,
}

enum Gate {
    Uninitialized,
    Intercepting(Interception),
    Closed,
}

struct Interception {
    /// Duplicate of the original descriptor, used to put it back on close
    restore: File,
    writer: PipeWriter,
    copy_loop: JoinHandle<CopyLoopExit>,
    drain: Arc<Drain>,
}

/// Fans out one output stream to a dynamic set of consumers
pub struct Forwarder {
    label: String,
    target: RawFd,
    config: ForwarderConfig,
    registry: Arc<Registry>,
    gate: Mutex<Gate>,
    /// Original destination while intercepting, for [`OriginalWriter`]
    original: RwLock<Option<Arc<File>>>,
    interceptions: AtomicUsize,
    live_loops: Arc<AtomicUsize>,
}

impl Forwarder {
    /// Forwarder for one of the standard streams.
    ///
    /// Most callers want the process-wide instance from [`forwarder`]; a
    /// second forwarder over the same stream would stack on top of the first.
    pub fn new(stream: StdStream, config: ForwarderConfig) -> Self {
        Self::for_fd(stream.name(), stream.fd(), config)
    }

    /// Forwarder over an arbitrary descriptor owned by the caller.
    ///
    /// The descriptor must stay open for as long as it is intercepted.
    pub fn for_fd(label: impl Into<String>, target: RawFd, config: ForwarderConfig) -> Self {
        Self {
            label: label.into(),
            target,
            config,
            registry: Arc::new(Registry::new()),
            gate: Mutex::new(Gate::Uninitialized),
            original: RwLock::new(None),
            interceptions: AtomicUsize::new(0),
            live_loops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> RawFd {
        self.target
    }

    pub fn config(&self) -> ForwarderConfig {
        self.config
    }

    pub fn state(&self) -> ForwarderState {
        match *self.lock_gate() {
            Gate::Uninitialized => ForwarderState::Uninitialized,
            Gate::Intercepting(_) => ForwarderState::Intercepting,
            Gate::Closed => ForwarderState::Closed,
        }
    }

    /// Number of interceptions performed (0 or 1)
    pub fn interceptions(&self) -> usize {
        self.interceptions.load(Ordering::SeqCst)
    }

    /// Number of copy loop threads currently running (0 or 1)
    pub fn live_copy_loops(&self) -> usize {
        self.live_loops.load(Ordering::SeqCst)
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn consumer_count(&self) -> usize {
        self.registry.len()
    }

    /// Intercept the stream if that has not happened yet.
    ///
    /// Safe to call concurrently; only the first successful call swaps the
    /// descriptor. A failed attempt leaves nothing installed, so a later call
    /// may try again. If the copy loop has died, the stream is intercepted
    /// again.
    pub fn ensure_intercepted(&self) -> Result<()> {
        let mut gate = self.lock_gate();
        self.ensure_intercepted_locked(&mut gate)
    }

    fn ensure_intercepted_locked(&self, gate: &mut Gate) -> Result<()> {
        let loop_died = matches!(gate, Gate::Intercepting(i) if i.copy_loop.is_finished());
        if loop_died {
            self.discard_dead_interception(gate)?;
        }

        match *gate {
            Gate::Intercepting(_) => Ok(()),
            Gate::Closed => Err(ForwardError::Closed),
            Gate::Uninitialized => {
                let interception = self.intercept()?;
                *gate = Gate::Intercepting(interception);
                self.interceptions.fetch_add(1, Ordering::SeqCst);
                info!(stream = %self.label, fd = self.target, "Output forwarding enabled");
                Ok(())
            }
        }
    }

    fn intercept(&self) -> Result<Interception> {
        self.flush_std();

        let raw = fcntl(self.target, FcntlArg::F_DUPFD_CLOEXEC(0))
            .map_err(|errno| ForwardError::Duplicate(io::Error::from(errno)))?;
        // SAFETY: fcntl just returned a fresh descriptor that nothing else owns
        let original = unsafe { File::from_raw_fd(raw) };
        let restore = original.try_clone().map_err(ForwardError::Duplicate)?;
        let bypass = original.try_clone().map_err(ForwardError::Duplicate)?;

        let (reader, writer) = os_pipe::pipe().map_err(ForwardError::Pipe)?;

        let fanout = FanOut::new(self.label.clone(), original, Arc::clone(&self.registry));
        let (copy_loop, drain) = copy_loop::spawn(
            &self.label,
            self.target,
            reader,
            fanout,
            self.config.read_buffer_size,
            Arc::clone(&self.live_loops),
        )
        .map_err(ForwardError::Spawn)?;

        if let Err(errno) = dup2(writer.as_raw_fd(), self.target) {
            // Closing the only write end lets the loop see EOF and exit
            drop(writer);
            let _ = copy_loop.join();
            return Err(ForwardError::Redirect(errno));
        }

        *self.original.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(bypass));

        Ok(Interception {
            restore,
            writer,
            copy_loop,
            drain,
        })
    }

    /// Undo an interception whose copy loop already exited, so the next
    /// interception starts from the original stream. Consumers are kept.
    fn discard_dead_interception(&self, gate: &mut Gate) -> Result<()> {
        let interception = match std::mem::replace(gate, Gate::Uninitialized) {
            Gate::Intercepting(interception) => interception,
            other => {
                *gate = other;
                return Ok(());
            }
        };

        // Restore before flushing: nobody reads the pipe any more
        if let Err(errno) = dup2(interception.restore.as_raw_fd(), self.target) {
            *gate = Gate::Intercepting(interception);
            return Err(ForwardError::Redirect(errno));
        }
        self.flush_std();
        *self.original.write().unwrap_or_else(PoisonError::into_inner) = None;

        let Interception {
            restore,
            writer,
            copy_loop,
            ..
        } = interception;
        drop(writer);
        drop(restore);
        let exit = copy_loop.join().ok();
        warn!(stream = %self.label, ?exit, "Copy loop had stopped, intercepting again");

        Ok(())
    }

    /// Forward to `writer` under `id`, intercepting first if needed
    pub fn register<W>(&self, id: &str, writer: W) -> Result<()>
    where
        W: Write + Send + 'static,
    {
        self.register_sink(id, Mutex::new(writer))
    }

    /// Forward to a custom sink under `id`, intercepting first if needed
    pub fn register_sink<S>(&self, id: &str, sink: S) -> Result<()>
    where
        S: Sink + 'static,
    {
        // Holding the gate keeps a concurrent close from slipping in between
        let mut gate = self.lock_gate();
        self.ensure_intercepted_locked(&mut gate)?;
        if self.registry.insert(id, Box::new(sink)) {
            debug!(stream = %self.label, consumer = id, "Replaced consumer");
        } else {
            debug!(stream = %self.label, consumer = id, "Added consumer");
        }
        Ok(())
    }

    /// Stop forwarding to `id`. Never fails.
    pub fn unregister(&self, id: &str) {
        if self.registry.remove(id) {
            debug!(stream = %self.label, consumer = id, "Removed consumer");
        }
    }

    /// Put the original descriptor back and stop the copy loop.
    ///
    /// Bytes already in the pipe are still forwarded before this returns.
    /// Children that inherited the redirected descriptor keep the pipe open,
    /// so this blocks until they exit. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut gate = self.lock_gate();
        let interception = match std::mem::replace(&mut *gate, Gate::Closed) {
            Gate::Intercepting(interception) => interception,
            Gate::Uninitialized | Gate::Closed => {
                self.registry.clear();
                return Ok(());
            }
        };

        self.flush_std();

        if let Err(errno) = dup2(interception.restore.as_raw_fd(), self.target) {
            // The pipe is still the stream; keep forwarding
            *gate = Gate::Intercepting(interception);
            return Err(ForwardError::Redirect(errno));
        }

        *self.original.write().unwrap_or_else(PoisonError::into_inner) = None;

        let Interception {
            restore,
            writer,
            copy_loop,
            ..
        } = interception;
        drop(writer);
        drop(restore);

        let exit = copy_loop.join().map_err(|_| ForwardError::CopyLoopPanicked)?;
        self.registry.clear();
        info!(stream = %self.label, ?exit, "Output forwarding disabled");

        Ok(())
    }

    /// Wait until every byte written to the stream before this call has
    /// reached the original destination and all consumers.
    ///
    /// Returns false if that did not happen within `timeout` or the copy loop
    /// stopped. Without an active interception there is nothing to wait for.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.flush_std();
        let drain = match &*self.lock_gate() {
            Gate::Intercepting(interception) => Arc::clone(&interception.drain),
            Gate::Uninitialized | Gate::Closed => return true,
        };
        drain.wait(timeout)
    }

    /// Writer to the pre-interception destination of this stream
    pub fn original_writer(&self) -> OriginalWriter<'_> {
        OriginalWriter { forwarder: self }
    }

    fn write_original(&self, buf: &[u8]) -> io::Result<usize> {
        let bypass = self
            .original
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match bypass {
            Some(file) => (&*file).write(buf),
            None => {
                // SAFETY: the descriptor is borrowed for this write only and
                // ManuallyDrop keeps it from being closed
                let file = ManuallyDrop::new(unsafe { File::from_raw_fd(self.target) });
                (&*file).write(buf)
            }
        }
    }

    fn flush_std(&self) {
        // Rust buffers stdout; push what it holds to the current destination
        if self.target == libc::STDOUT_FILENO {
            let _ = io::stdout().flush();
        }
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(stream = %self.label, error = %e, "Failed to stop output forwarding");
        }
    }
}

/// Writes straight to a stream's original destination, bypassing the fan-out.
///
/// Before interception (and after close) this is the stream itself.
pub struct OriginalWriter<'a> {
    forwarder: &'a Forwarder,
}

impl Write for OriginalWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.forwarder.write_original(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
