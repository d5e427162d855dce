// Library interface for stdtee
// Process-wide stdout/stderr fan-out plus the daemon that streams it to clients

pub mod config;
pub mod daemon;
pub mod error;
pub mod forward;
pub mod logging;
pub mod stream;

pub use error::ForwardError;
pub use forward::{
    forwarder, original_writer, register_consumer, register_consumer_sink, unregister_consumer,
    Forwarder, ForwarderState, OriginalWriter, Sink,
};
pub use stream::StdStream;
