/// stdtee daemon: streams the daemon's own stdout/stderr to attached clients
///
/// - `protocol`: Message framing and serialization (length-prefixed binary format)
/// - `server`: Unix socket server, one thread per attached client
/// - `client`: Client side of an attach session
/// - `config`: stdteed.conf parsing

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use config::DaemonConfig;
pub use protocol::{
    decode_message, encode_message, read_message, write_message, Attach, AttachAck, Chunk,
    ErrorMessage, Job, JobFinished, Message,
};
pub use server::DaemonServer;
