//! WebSocket wire protocol.
//!
//! Every frame is one binary WebSocket message holding a bincode-encoded
//! [`ClientFrame`] or [`ServerFrame`]:
//! ```text
//! client ──► ClientFrame { request, message }
//! server ──► ServerFrame { request: Some(n), message }   reply to request n
//!            ServerFrame { request: None,    message: Event(..) }   live event
//! ```
//!
//! A connection is bound to one `(document, author)` by its first `Join`.
//! A `Replay` is answered by zero or more `ReplayBatch` frames and a closing
//! `ReplayDone`; every other request gets exactly one reply.

use serde::{Deserialize, Serialize};

use concord_core::{AuthorId, DocumentId, OpPayload, VectorClock};

use crate::broadcast::Event;
use crate::engine::{HeartbeatAck, SubmitResult};
use crate::error::{ErrorCode, ProtocolError, SyncError};
use crate::storage::OperationRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join { document: DocumentId, author: AuthorId },
    Submit { observed: VectorClock, payload: OpPayload },
    Heartbeat { payload: Vec<u8> },
    Leave,
    /// Committed operations from `from` to the current head.
    Replay { from: u64 },
    /// Live operations (catching up from `from` first) and presence events.
    Subscribe { from: u64 },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined { sequence: u64, clock: VectorClock },
    Committed(SubmitResult),
    PresenceAck(HeartbeatAck),
    Left,
    ReplayBatch(Vec<OperationRecord>),
    /// Last sequence the replay covered (0 if none).
    ReplayDone { through: u64 },
    Subscribed,
    Event(Event),
    Error {
        code: ErrorCode,
        message: String,
        reset_secs: Option<u64>,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(err: &SyncError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
            reset_secs: err.retry_after(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: ErrorCode::BadRequest,
            message: message.into(),
            reset_secs: None,
        }
    }

    /// Whether this ends the reply to a request.
    pub fn is_final(&self) -> bool {
        !matches!(self, ServerMessage::ReplayBatch(_) | ServerMessage::Event(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub request: u64,
    pub message: ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub request: Option<u64>,
    pub message: ServerMessage,
}

impl ServerFrame {
    pub fn reply(request: u64, message: ServerMessage) -> Self {
        Self {
            request: Some(request),
            message,
        }
    }

    pub fn event(event: Event) -> Self {
        Self {
            request: None,
            message: ServerMessage::Event(event),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
