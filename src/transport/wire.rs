//! On-the-wire envelope carried inside each websocket binary frame.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HostError, Result};

#[derive(Debug, Clone, Copy, Encode, Decode, Serialize, Deserialize)]
struct WireUuid([u8; 16]);

impl From<Uuid> for WireUuid {
    fn from(value: Uuid) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<WireUuid> for Uuid {
    fn from(value: WireUuid) -> Self {
        Uuid::from_bytes(value.0)
    }
}

#[derive(Debug, Clone, Encode, Decode)]
enum WireMessageRepr {
    Chunk {
        message_id: WireUuid,
        seq: u32,
        total: u32,
        bytes: Vec<u8>,
    },
    Ack {
        message_id: WireUuid,
    },
    Ping {
        nonce: WireUuid,
    },
    Pong {
        nonce: WireUuid,
    },
}

/// A single transport-level message: either a chunk of a larger payload, an
/// acknowledgement of a fully-received payload, or a liveness ping/pong.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Chunk {
        message_id: Uuid,
        seq: u32,
        total: u32,
        bytes: Vec<u8>,
    },
    Ack {
        message_id: Uuid,
    },
    Ping {
        nonce: Uuid,
    },
    Pong {
        nonce: Uuid,
    },
}

impl From<WireMessage> for WireMessageRepr {
    fn from(value: WireMessage) -> Self {
        match value {
            WireMessage::Chunk {
                message_id,
                seq,
                total,
                bytes,
            } => Self::Chunk {
                message_id: message_id.into(),
                seq,
                total,
                bytes,
            },
            WireMessage::Ack { message_id } => Self::Ack {
                message_id: message_id.into(),
            },
            WireMessage::Ping { nonce } => Self::Ping { nonce: nonce.into() },
            WireMessage::Pong { nonce } => Self::Pong { nonce: nonce.into() },
        }
    }
}

impl From<WireMessageRepr> for WireMessage {
    fn from(value: WireMessageRepr) -> Self {
        match value {
            WireMessageRepr::Chunk {
                message_id,
                seq,
                total,
                bytes,
            } => Self::Chunk {
                message_id: message_id.into(),
                seq,
                total,
                bytes,
            },
            WireMessageRepr::Ack { message_id } => Self::Ack {
                message_id: message_id.into(),
            },
            WireMessageRepr::Ping { nonce } => Self::Ping { nonce: nonce.into() },
            WireMessageRepr::Pong { nonce } => Self::Pong { nonce: nonce.into() },
        }
    }
}

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Serialize a [`WireMessage`] to bytes for a websocket binary frame.
///
/// # Errors
/// Returns [`HostError::Fatal`] if encoding fails (never expected for these
/// fixed-shape enums, but surfaced rather than panicking).
pub fn encode(message: &WireMessage) -> Result<Vec<u8>> {
    let repr: WireMessageRepr = message.clone().into();
    bincode::encode_to_vec(repr, BINCODE_CONFIG)
        .map_err(|e| HostError::Fatal(format!("wire encode failed: {e}")))
}

/// Deserialize a [`WireMessage`] from a websocket binary frame.
///
/// # Errors
/// Returns [`HostError::Fatal`] if the bytes are not a valid encoding.
pub fn decode(bytes: &[u8]) -> Result<WireMessage> {
    let (repr, _): (WireMessageRepr, usize) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)
        .map_err(|e| HostError::Fatal(format!("wire decode failed: {e}")))?;
    Ok(repr.into())
}
