use crate::daemon::config::DaemonConfig;
use crate::daemon::protocol::{
    read_message, write_message, Attach, AttachAck, Chunk, ErrorMessage, Job, JobFinished,
    Message, MessageId,
};
use crate::forward::{self, Sink};
use crate::stream::StdStream;
use anyhow::{anyhow, Result};
use nix::sys::signal;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A client that stops reading blocks the copy loop for at most this long
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between job steps
const STEP_INTERVAL: Duration = Duration::from_millis(20);

/// Largest step count a client may request
pub const MAX_JOB_STEPS: u32 = 10_000;

/// Ids of currently attached clients
type AttachedClients = Arc<Mutex<HashSet<String>>>;

/// Consumer that frames forwarded bytes onto a client connection.
///
/// A failed or timed-out write can leave a partial frame on the socket, so
/// after the first failure the sink shuts the connection down and fails
/// fast. The session handler then sees EOF and unregisters it.
struct FrameSink {
    stream: StdStream,
    conn: Arc<Mutex<UnixStream>>,
    message_id: MessageId,
    broken: AtomicBool,
}

impl Sink for FrameSink {
    fn write_chunk(&self, chunk: &[u8]) -> io::Result<()> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client connection closed"));
        }

        let message = Message::Chunk(Chunk {
            stream: self.stream,
            data: chunk.to_vec(),
        });
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let result = write_message(&mut *conn, &message, self.message_id);
        if result.is_err() {
            self.broken.store(true, Ordering::Relaxed);
            let _ = conn.shutdown(Shutdown::Both);
        }
        result
    }
}

/// Unix socket daemon that streams its own stdout/stderr to attached clients
pub struct DaemonServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    config: DaemonConfig,
    shutdown: Arc<AtomicBool>,
    clients: AttachedClients,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, config: DaemonConfig) -> Self {
        Self {
            socket_path,
            listener: None,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            clients: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Flag that stops the accept loop when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Path of the PID file next to the socket
    pub fn pid_path(socket_path: &Path) -> PathBuf {
        socket_path.with_file_name("daemon.pid")
    }

    /// Create the daemon directory with secure permissions
    fn create_daemon_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;

        let daemon_dir = home.join(".stdtee");

        if !daemon_dir.exists() {
            fs::create_dir(&daemon_dir)?;

            // Set directory permissions to 0700 (owner only)
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&daemon_dir)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&daemon_dir, perms)?;
        }

        Ok(daemon_dir)
    }

    /// Socket path from the config, or ~/.stdtee/daemon.sock
    pub fn socket_path_for(config: &DaemonConfig) -> Result<PathBuf> {
        match &config.socket_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::create_daemon_dir()?.join("daemon.sock")),
        }
    }

    /// Start the daemon server (blocks until SIGINT/SIGTERM)
    ///
    /// On the way out the process streams are handed back to their original
    /// destinations.
    pub fn start(&mut self) -> Result<()> {
        self.setup_signal_handlers()?;
        self.bind()?;
        self.write_pid_file()?;

        info!(socket = %self.socket_path.display(), "stdtee daemon started");

        let result = self.run();
        self.release_streams();
        result
    }

    /// Bind the Unix socket
    pub fn bind(&mut self) -> Result<()> {
        // Remove stale socket if it exists
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Set socket permissions to 0600 (owner read/write only)
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&self.socket_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&self.socket_path, perms)?;

        self.listener = Some(listener);

        Ok(())
    }

    /// Setup signal handlers for graceful shutdown
    fn setup_signal_handlers(&self) -> Result<()> {
        signal_hook::flag::register(signal::SIGTERM as i32, Arc::clone(&self.shutdown))?;
        signal_hook::flag::register(signal::SIGINT as i32, Arc::clone(&self.shutdown))?;
        Ok(())
    }

    /// Accept clients until the shutdown flag is set
    pub fn run(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or_else(|| anyhow!("Socket not bound"))?;

        // Non-blocking accept so the shutdown flag is checked regularly
        listener.set_nonblocking(true)?;

        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    self.spawn_session(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    warn!(error = %e, "Error accepting connection");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        self.listener = Some(listener);

        info!("Shutting down daemon");
        self.cleanup_files();

        Ok(())
    }

    fn spawn_session(&self, stream: UnixStream) {
        let clients = Arc::clone(&self.clients);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("stdtee-session".to_string())
            .spawn(move || {
                if let Err(e) = handle_session(stream, &config, &clients) {
                    warn!(error = %e, "Session failed");
                }
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start session thread");
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        let pid_path = Self::pid_path(&self.socket_path);
        fs::write(&pid_path, std::process::id().to_string())?;
        Ok(())
    }

    fn release_streams(&self) {
        for stream in StdStream::ALL {
            if let Err(e) = forward::forwarder(stream).close() {
                warn!(stream = %stream, error = %e, "Failed to stop output forwarding");
            }
        }
    }

    fn cleanup_files(&self) {
        let _ = fs::remove_file(Self::pid_path(&self.socket_path));
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        self.cleanup_files();
    }
}

/// Removes a client id from the attached set when the session ends
struct AttachedGuard {
    clients: AttachedClients,
    client_id: String,
}

impl Drop for AttachedGuard {
    fn drop(&mut self) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.client_id);
    }
}

fn send_error(conn: &Mutex<UnixStream>, message: &str, msg_id: MessageId) -> Result<()> {
    let error = Message::Error(ErrorMessage {
        message: message.to_string(),
    });
    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
    write_message(&mut *conn, &error, msg_id)?;
    Ok(())
}

fn handle_session(stream: UnixStream, config: &DaemonConfig, clients: &AttachedClients) -> Result<()> {
    let mut reader = stream.try_clone()?;
    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    let conn = Arc::new(Mutex::new(stream));

    let (msg, msg_id) = match read_message(&mut reader) {
        Ok(result) => result,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(anyhow!("Failed to read message: {}", e)),
    };

    let attach = match msg {
        Message::Attach(attach) => attach,
        _ => {
            send_error(&conn, "Expected Attach", msg_id)?;
            return Ok(());
        }
    };

    if attach.client_id.is_empty() || attach.streams.is_empty() {
        send_error(&conn, "Attach needs a client id and at least one stream", msg_id)?;
        return Ok(());
    }

    if let Some(job) = &attach.job {
        if job.steps > MAX_JOB_STEPS {
            let message = format!("Job steps must be at most {}, got {}", MAX_JOB_STEPS, job.steps);
            send_error(&conn, &message, msg_id)?;
            return Ok(());
        }
    }

    let _guard = {
        let mut attached = clients.lock().unwrap_or_else(PoisonError::into_inner);
        if attached.len() >= config.max_clients {
            drop(attached);
            warn!(client = %attach.client_id, "Maximum concurrent clients reached, rejecting");
            send_error(&conn, "Maximum concurrent clients reached", msg_id)?;
            return Ok(());
        }
        if !attached.insert(attach.client_id.clone()) {
            drop(attached);
            send_error(&conn, &format!("Client id '{}' is already attached", attach.client_id), msg_id)?;
            return Ok(());
        }
        AttachedGuard {
            clients: Arc::clone(clients),
            client_id: attach.client_id.clone(),
        }
    };

    // Intercept before acknowledging so setup failures reach the client
    for &stream in &attach.streams {
        if let Err(e) = forward::forwarder(stream).ensure_intercepted() {
            send_error(&conn, &e.to_string(), msg_id)?;
            return Ok(());
        }
    }

    let ack = Message::AttachAck(AttachAck {
        client_id: attach.client_id.clone(),
        streams: attach.streams.clone(),
    });
    {
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        write_message(&mut *conn, &ack, msg_id)?;
    }

    let registered = register_client(&attach, &conn, msg_id);
    info!(client = %attach.client_id, streams = ?attach.streams, "Client attached");

    let result = match registered {
        Err(e) => send_error(&conn, &e.to_string(), msg_id),
        Ok(()) => match &attach.job {
            Some(job) => {
                let exit_code = run_job(job);
                // The job's last lines must reach this client before it hears
                // the job is done
                for &stream in &attach.streams {
                    if !forward::forwarder(stream).drain(config.drain_timeout) {
                        warn!(client = %attach.client_id, %stream, "Job output not fully forwarded");
                    }
                }
                unregister_client(&attach);
                let finished = Message::JobFinished(JobFinished { exit_code });
                let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                write_message(&mut *conn, &finished, msg_id).map_err(Into::into)
            }
            None => {
                follow_until_detached(&mut reader, &attach.client_id);
                Ok(())
            }
        },
    };

    unregister_client(&attach);
    info!(client = %attach.client_id, "Client detached");

    result
}

fn register_client(attach: &Attach, conn: &Arc<Mutex<UnixStream>>, msg_id: MessageId) -> Result<()> {
    for &stream in &attach.streams {
        let sink = FrameSink {
            stream,
            conn: Arc::clone(conn),
            message_id: msg_id,
            broken: AtomicBool::new(false),
        };
        if let Err(e) = forward::register_consumer_sink(stream, &attach.client_id, sink) {
            unregister_client(attach);
            return Err(e.into());
        }
    }
    Ok(())
}

fn unregister_client(attach: &Attach) {
    for &stream in &attach.streams {
        forward::unregister_consumer(stream, &attach.client_id);
    }
}

/// Block until the client detaches or hangs up
fn follow_until_detached(reader: &mut UnixStream, client_id: &str) {
    loop {
        match read_message(reader) {
            Ok((Message::Detach, _)) => {
                debug!(client = client_id, "Client sent detach");
                return;
            }
            Ok((other, _)) => {
                debug!(client = client_id, message = ?other, "Ignoring message while following");
            }
            Err(_) => return,
        }
    }
}

/// Run a job, reporting progress on stdout and a summary on stderr.
///
/// Writes go through the process streams directly so they are forwarded to
/// every attached client.
fn run_job(job: &Job) -> i32 {
    match write_job_progress(job) {
        Ok(()) => 0,
        Err(e) => {
            warn!(job = %job.name, error = %e, "Job could not report progress");
            1
        }
    }
}

fn write_job_progress(job: &Job) -> io::Result<()> {
    let started = chrono::Local::now();
    for step in 1..=job.steps {
        writeln!(
            io::stdout().lock(),
            "[{}] {}: step {}/{}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            job.name,
            step,
            job.steps
        )?;
        thread::sleep(STEP_INTERVAL);
    }
    let elapsed = chrono::Local::now() - started;
    writeln!(
        io::stderr().lock(),
        "{}: finished {} steps in {}ms",
        job.name,
        job.steps,
        elapsed.num_milliseconds()
    )
}
