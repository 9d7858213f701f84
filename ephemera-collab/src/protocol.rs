//! Wire protocol spoken over an editor channel.
//!
//! Binary frames carry CRDT sync traffic (lib0 varint encoding):
//! ```text
//! ┌──────────┬─────────────┬──────────┐
//! │ tag      │ payload len │ payload  │
//! │ varuint  │ varuint     │ variable │
//! └──────────┴─────────────┴──────────┘
//! ```
//! `SyncStep1` is the tag alone. Text frames carry JSON control messages
//! tagged by a `type` field.

use serde::{Deserialize, Serialize};
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::document::Ttl;

/// Binary frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Request for the full document state
    SyncStep1 = 0,
    /// Full document state
    SyncStep2 = 1,
    /// Incremental CRDT update
    Update = 2,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::SyncStep1),
            1 => Some(Self::SyncStep2),
            2 => Some(Self::Update),
            _ => None,
        }
    }
}

/// A decoded binary sync frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    SyncStep1,
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
}

impl SyncFrame {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncFrame::SyncStep1 => MessageType::SyncStep1,
            SyncFrame::SyncStep2(_) => MessageType::SyncStep2,
            SyncFrame::Update(_) => MessageType::Update,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            SyncFrame::SyncStep1 => {
                let mut buf = Vec::with_capacity(1);
                buf.write_var(MessageType::SyncStep1 as u32);
                buf
            }
            SyncFrame::SyncStep2(payload) | SyncFrame::Update(payload) => {
                let mut buf = Vec::with_capacity(payload.len() + 6);
                buf.write_var(self.message_type() as u32);
                buf.write_buf(payload);
                buf
            }
        }
    }

    /// Deserialize from the binary wire format.
    ///
    /// Bytes trailing a `SyncStep1` tag are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor
            .read_var()
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match MessageType::from_tag(tag) {
            Some(MessageType::SyncStep1) => Ok(SyncFrame::SyncStep1),
            Some(MessageType::SyncStep2) => Ok(SyncFrame::SyncStep2(Self::read_payload(&mut cursor)?)),
            Some(MessageType::Update) => Ok(SyncFrame::Update(Self::read_payload(&mut cursor)?)),
            None => Err(ProtocolError::UnknownTag(tag)),
        }
    }

    fn read_payload(cursor: &mut Cursor<'_>) -> Result<Vec<u8>, ProtocolError> {
        cursor
            .read_buf()
            .map(|payload| payload.to_vec())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// JSON control messages pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once on admission
    Meta {
        #[serde(rename = "expiresAt")]
        expires_at: u64,
        ttl: Ttl,
    },
    /// Live connection count
    Presence { count: usize },
    /// The document was destroyed; the channel closes next
    Expired,
    /// Non-fatal warning (e.g. size limit hit)
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// JSON control messages accepted from editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Cursor/selection sharing. Accepted but not acted on yet.
    Awareness {
        #[serde(default)]
        state: serde_json::Value,
    },
}

impl ClientMessage {
    /// Parse a text frame. Unknown types and malformed JSON yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message tag {0}")]
    UnknownTag(u32),
}
