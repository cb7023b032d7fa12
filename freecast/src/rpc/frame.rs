//! Length-framed wire records.
//!
//! Each record on the channel is a 4-byte big-endian length followed by that
//! many bytes of JSON. Framing keeps record boundaries independent of payload
//! content; the length cap rejects garbage before allocating for it. A
//! malformed record is connection-fatal - a length-framed stream cannot be
//! resynchronized once a bad length has been consumed - and surfaces to the
//! protocol layer as a disconnect.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::payload::Payload;

/// Largest accepted record, matching the size guard the protocol has always
/// enforced on inbound messages.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors from reading or writing a framed record.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge { len: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One record on the wire: a command or the reply to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record")]
pub enum Record {
    /// A request to do something, dispatched by `kind` on the receiver.
    Command {
        /// Process-unique at time of sending; never reused while unresolved.
        id: u64,
        /// Discriminates the handler on the receiving side.
        kind: String,
        /// Handler arguments, opaque to the protocol core.
        payload: Payload,
    },
    /// The response to a command, matched by `id`.
    Reply {
        id: u64,
        result: Result<Payload, String>,
    },
}

impl Record {
    /// The command id this record carries.
    pub fn id(&self) -> u64 {
        match self {
            Record::Command { id, .. } | Record::Reply { id, .. } => *id,
        }
    }
}

/// Serializes `record` and writes it as one length-prefixed frame.
pub fn write_record(writer: &mut impl Write, record: &Record) -> Result<(), FrameError> {
    let body = serde_json::to_vec(record)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len: body.len() });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame and deserializes the record.
pub fn read_record(reader: &mut impl Read) -> Result<Record, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
