//! stdteed wire protocol
//!
//! Length-prefixed binary messages over a Unix socket:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Length covers the message ID and payload, little-endian. A session is:
//! client sends `Attach`, daemon answers `AttachAck` (or `Error`), then
//! streams `Chunk`s until the job finishes (`JobFinished`) or the client
//! sends `Detach` / hangs up. Every frame of a session reuses the `Attach`
//! message ID.

use crate::stream::StdStream;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Maximum message size (10MB to prevent memory exhaustion)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Message ID type (request/response correlation)
pub type MessageId = u32;

/// Message envelope containing all possible message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client asks to receive the daemon's output
    Attach(Attach),
    /// Daemon confirms the client is registered
    AttachAck(AttachAck),
    /// A forwarded piece of daemon output
    Chunk(Chunk),
    /// The requested job completed (Daemon → Client)
    JobFinished(JobFinished),
    /// Client stops following
    Detach,
    /// Request rejected or failed
    Error(ErrorMessage),
}

/// Attach request (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attach {
    /// Consumer id, unique among attached clients
    pub client_id: String,
    /// Streams to receive
    pub streams: Vec<StdStream>,
    /// Job to run while attached; None follows until detach
    pub job: Option<Job>,
}

/// Unit of daemon work whose progress is streamed back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub steps: u32,
}

/// Attach acknowledgment (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachAck {
    pub client_id: String,
    pub streams: Vec<StdStream>,
}

/// Forwarded output (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub stream: StdStream,
    pub data: Vec<u8>,
}

/// Job completion (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFinished {
    pub exit_code: i32,
}

/// Error response (Daemon → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte message ID][bincode payload]
pub fn encode_message(message: &Message, message_id: MessageId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", payload.len()),
            )
        })?;

    let mut buffer = Vec::with_capacity(8 + payload.len());
    // Length prefix includes message_id + payload
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode a message from the wire format
///
/// Returns (message, message_id)
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if frame_len > MAX_MESSAGE_SIZE + 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", frame_len),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let mut payload = vec![0u8; (frame_len - 4) as usize];
    reader.read_exact(&mut payload)?;

    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> io::Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    decode_message(reader)
}
