//! Operation payloads and document state, tagged by document kind.
//!
//! The engine never looks inside a payload; it only routes it to the
//! [`MergeFunction`](crate::merge::MergeFunction) registered for its kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::merge::counter::PnCounter;
use crate::merge::map::LwwMap;
use crate::merge::text::TextState;

/// The CRDT type a document holds. Fixed by the document's first operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Rich text backed by a Yjs document.
    Text,
    /// Last-writer-wins map of metadata fields.
    Map,
    /// Per-author PN-counter.
    Counter,
    /// Application-defined payload merged by a registered function.
    Custom(String),
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Text => f.write_str("text"),
            DocumentKind::Map => f.write_str("map"),
            DocumentKind::Counter => f.write_str("counter"),
            DocumentKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// One edit, as submitted by an author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Yjs v1 update against the document's text.
    Text { update: Vec<u8> },
    /// Set a map field. `value` is JSON text.
    MapSet { key: String, value: String },
    /// Remove a map field.
    MapDelete { key: String },
    /// Add `delta` (may be negative) to the author's counter contribution.
    CounterAdd { delta: i64 },
    Custom { kind: String, data: Vec<u8> },
}

impl OpPayload {
    pub fn kind(&self) -> DocumentKind {
        match self {
            OpPayload::Text { .. } => DocumentKind::Text,
            OpPayload::MapSet { .. } | OpPayload::MapDelete { .. } => DocumentKind::Map,
            OpPayload::CounterAdd { .. } => DocumentKind::Counter,
            OpPayload::Custom { kind, .. } => DocumentKind::Custom(kind.clone()),
        }
    }

    /// Short operation type tag stored alongside the log record.
    pub fn operation_type(&self) -> &'static str {
        match self {
            OpPayload::Text { .. } => "text.update",
            OpPayload::MapSet { .. } => "map.set",
            OpPayload::MapDelete { .. } => "map.delete",
            OpPayload::CounterAdd { .. } => "counter.add",
            OpPayload::Custom { .. } => "custom",
        }
    }
}

/// Merged state of a document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum DocumentState {
    /// No operation has been applied yet.
    #[default]
    Empty,
    Text(TextState),
    Map(LwwMap),
    Counter(PnCounter),
    Custom { kind: String, data: Vec<u8> },
}

impl DocumentState {
    /// Kind of the state, or `None` for a document nobody has written to.
    pub fn kind(&self) -> Option<DocumentKind> {
        match self {
            DocumentState::Empty => None,
            DocumentState::Text(_) => Some(DocumentKind::Text),
            DocumentState::Map(_) => Some(DocumentKind::Map),
            DocumentState::Counter(_) => Some(DocumentKind::Counter),
            DocumentState::Custom { kind, .. } => Some(DocumentKind::Custom(kind.clone())),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DocumentState::Empty)
    }

    pub fn as_text(&self) -> Option<&TextState> {
        match self {
            DocumentState::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&LwwMap> {
        match self {
            DocumentState::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<&PnCounter> {
        match self {
            DocumentState::Counter(c) => Some(c),
            _ => None,
        }
    }
}
