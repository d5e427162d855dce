//! stdtee daemon binary
//!
//! Provides commands to start, stop, and inspect the daemon.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::env;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;
use stdtee::daemon::{DaemonConfig, DaemonServer};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let config = DaemonConfig::load();

    match args[1].as_str() {
        "start" => start_daemon(config),
        "stop" => stop_daemon(&config),
        "status" => check_status(&config),
        "restart" => {
            stop_daemon(&config)?;
            thread::sleep(Duration::from_millis(500));
            start_daemon(config)
        }
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Error: Unknown command '{}'", other);
            print_usage();
            process::exit(1);
        }
    }
}

fn start_daemon(config: DaemonConfig) -> Result<()> {
    let socket_path = DaemonServer::socket_path_for(&config)?;

    if socket_path.exists() {
        if UnixStream::connect(&socket_path).is_ok() {
            eprintln!("Error: Daemon is already running at {}", socket_path.display());
            eprintln!("Use 'stdteed stop' to stop it first, or 'stdteed restart' to restart.");
            process::exit(1);
        }
        // Stale socket file
        fs::remove_file(&socket_path)?;
    }

    stdtee::logging::init(&config.log_filter);

    println!("Starting stdtee daemon at {}", socket_path.display());
    println!("Use 'stdtee follow' to stream its output.");

    let mut daemon = DaemonServer::new(socket_path, config);
    daemon.start()
}

fn read_pid(socket_path: &Path) -> Result<Option<i32>> {
    let pid_path = DaemonServer::pid_path(socket_path);
    if !pid_path.exists() {
        return Ok(None);
    }
    let pid_str = fs::read_to_string(&pid_path)?;
    let pid = pid_str
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid PID in {}", pid_path.display()))?;
    Ok(Some(pid))
}

fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    let socket_path = DaemonServer::socket_path_for(config)?;

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if UnixStream::connect(&socket_path).is_err() {
        println!("Removing stale socket file.");
        fs::remove_file(&socket_path)?;
        return Ok(());
    }

    let Some(pid) = read_pid(&socket_path)? else {
        eprintln!("Warning: PID file not found. Cannot send signal to daemon.");
        return Ok(());
    };

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| anyhow!("Failed to signal daemon (PID {}): {}", pid, e))?;
    println!("Sent shutdown signal to daemon (PID {}).", pid);

    // Wait for socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Daemon stopped.");
            return Ok(());
        }
    }

    eprintln!("Warning: Daemon may not have stopped cleanly.");
    Ok(())
}

fn check_status(config: &DaemonConfig) -> Result<()> {
    let socket_path = DaemonServer::socket_path_for(config)?;

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if UnixStream::connect(&socket_path).is_ok() {
        println!("Daemon is running at {}", socket_path.display());
        if let Ok(Some(pid)) = read_pid(&socket_path) {
            println!("PID: {}", pid);
        }
    } else {
        println!("Socket file exists but daemon is not responding.");
        println!("This may be a stale socket. Try 'stdteed start' to restart.");
    }

    Ok(())
}

fn print_usage() {
    println!("stdtee daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: stdteed <command>");
    println!();
    println!("Commands:");
    println!("  start      Start the daemon");
    println!("  stop       Stop the daemon");
    println!("  status     Check daemon status");
    println!("  restart    Restart the daemon");
    println!("  -h, --help Show this help message");
    println!();
    println!("Configuration is read from ~/.stdtee/stdteed.conf and STDTEE_* variables.");
}
