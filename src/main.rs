#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use stdtee::daemon::{Chunk, DaemonClient, DaemonConfig, DaemonServer, Job};
use stdtee::StdStream;

/// Default number of steps for `stdtee run`
const DEFAULT_JOB_STEPS: u32 = 5;

#[derive(Debug, PartialEq)]
enum Command {
    Follow,
    Run { job: String, steps: u32 },
    Help,
}

#[derive(Debug, PartialEq)]
struct CliArgs {
    socket: Option<PathBuf>,
    client_id: Option<String>,
    streams: Vec<StdStream>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut socket = None;
    let mut client_id = None;
    let mut streams = Vec::new();
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                let value = args.get(i + 1).ok_or_else(|| anyhow!("--socket needs a path"))?;
                socket = Some(PathBuf::from(value));
                i += 2;
            }
            "--id" => {
                let value = args.get(i + 1).ok_or_else(|| anyhow!("--id needs a value"))?;
                client_id = Some(value.clone());
                i += 2;
            }
            "--stdout" => {
                streams.push(StdStream::Stdout);
                i += 1;
            }
            "--stderr" => {
                streams.push(StdStream::Stderr);
                i += 1;
            }
            "-h" | "--help" => {
                return Ok(CliArgs {
                    socket,
                    client_id,
                    streams,
                    command: Command::Help,
                });
            }
            flag if flag.starts_with("--") => return Err(anyhow!("Unknown option '{}'", flag)),
            _ => {
                positional.push(args[i].clone());
                i += 1;
            }
        }
    }

    if streams.is_empty() {
        streams = StdStream::ALL.to_vec();
    }
    let mut unique = Vec::with_capacity(streams.len());
    for stream in streams {
        if !unique.contains(&stream) {
            unique.push(stream);
        }
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("follow") => Command::Follow,
        Some("run") => {
            let job = positional
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("run needs a job name"))?;
            let steps = match positional.get(2) {
                Some(s) => s.parse().map_err(|_| anyhow!("Invalid step count '{}'", s))?,
                None => DEFAULT_JOB_STEPS,
            };
            Command::Run { job, steps }
        }
        Some(other) => return Err(anyhow!("Unknown command '{}'", other)),
    };

    Ok(CliArgs {
        socket,
        client_id,
        streams: unique,
        command,
    })
}

fn write_chunk(chunk: &Chunk) -> io::Result<()> {
    match chunk.stream {
        StdStream::Stdout => {
            let mut out = io::stdout().lock();
            out.write_all(&chunk.data)?;
            out.flush()
        }
        StdStream::Stderr => io::stderr().lock().write_all(&chunk.data),
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            process::exit(2);
        }
    };

    if cli.command == Command::Help {
        print_usage();
        return Ok(());
    }

    let socket_path = match cli.socket {
        Some(path) => path,
        None => DaemonServer::socket_path_for(&DaemonConfig::load())?,
    };
    let client_id = cli
        .client_id
        .unwrap_or_else(|| format!("client-{}", process::id()));

    let mut client = DaemonClient::new(socket_path);
    if !client.is_daemon_running() {
        eprintln!(
            "Error: No daemon listening at {}. Start one with 'stdteed start'.",
            client.socket_path().display()
        );
        process::exit(1);
    }

    let job = match cli.command {
        Command::Run { job, steps } => Some(Job { name: job, steps }),
        _ => None,
    };

    match client.attach(&client_id, &cli.streams, job, write_chunk)? {
        Some(exit_code) => process::exit(exit_code),
        None => Ok(()),
    }
}

fn print_usage() {
    println!("stdtee v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: stdtee [options] [follow | run <job> [steps]]");
    println!();
    println!("Commands:");
    println!("  follow             Stream the daemon's output until interrupted (default)");
    println!("  run <job> [steps]  Ask the daemon to run a job and stream its progress");
    println!();
    println!("Options:");
    println!("  --socket <path>    Daemon socket (default: ~/.stdtee/daemon.sock)");
    println!("  --id <id>          Client id (default: client-<pid>)");
    println!("  --stdout           Receive only stdout (combine with --stderr)");
    println!("  --stderr           Receive only stderr");
    println!("  -h, --help         Show this help message");
}
