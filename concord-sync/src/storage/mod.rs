//! Persistent storage for documents, operation logs, and checkpoints.
//!
//! ```text
//! ┌──────────────┐  append(doc, op, expected_seq)   ┌──────────────────┐
//! │ OperationLog │ ───────────────────────────────► │ dyn LogStore     │
//! │ (per-doc     │  read_operations(doc, from, n)   │  MemoryStore     │
//! │  mutex)      │ ◄─────────────────────────────── │  RocksStore      │
//! └──────────────┘  compact(checkpoint)             └──────────────────┘
//! ```
//!
//! Every mutation a store exposes is atomic: `append` writes the operation
//! and the new document head together or not at all, and `compact` writes a
//! checkpoint together with the deletion of the operations it covers.

pub mod memory;
pub mod rocks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use concord_core::{
    AuthorId, DocumentId, DocumentState, LoggedOp, OpPayload, PendingOperation, VectorClock,
};

use crate::error::{CommitError, StoreError};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Workflow status, owned by an external workflow and only read here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    #[default]
    Draft,
    Active,
    /// No further writes are accepted.
    Locked,
}

/// Authoritative head of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub state: DocumentState,
    pub clock: VectorClock,
    /// Sequence number of the last committed operation (0 = none).
    pub sequence: u64,
    pub status: DocumentStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// A document nobody has written to yet.
    pub fn empty(id: DocumentId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: DocumentState::Empty,
            clock: VectorClock::new(),
            sequence: 0,
            status: DocumentStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One committed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub sequence: u64,
    pub operation_type: String,
    pub author: AuthorId,
    /// The clock the author observed when issuing the operation.
    pub clock: VectorClock,
    pub payload: OpPayload,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub applied_at: DateTime<Utc>,
    pub conflict: bool,
}

impl OperationRecord {
    pub fn new(
        document_id: DocumentId,
        sequence: u64,
        op: &PendingOperation,
        applied_at: DateTime<Utc>,
        conflict: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            sequence,
            operation_type: op.payload.operation_type().to_string(),
            author: op.author.clone(),
            clock: op.observed.clone(),
            payload: op.payload.clone(),
            applied_at,
            conflict,
        }
    }

    /// View for [`MergeEngine::replay`](concord_core::MergeEngine::replay).
    pub fn logged(&self) -> LoggedOp<'_> {
        LoggedOp {
            author: &self.author,
            observed: &self.clock,
            payload: &self.payload,
        }
    }

    /// The operation's clock after its author's increment.
    pub fn stamped(&self) -> VectorClock {
        self.clock.increment(&self.author)
    }
}

/// Folded prefix of a document's log: the state and clock after applying
/// every operation up to and including `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub document_id: DocumentId,
    pub sequence: u64,
    pub state: DocumentState,
    pub clock: VectorClock,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// First sequence number still present in the log.
    pub fn first_available(&self) -> u64 {
        self.sequence + 1
    }
}

/// Storage backend for the operation log.
///
/// Calls are synchronous; the operation log serializes writers per document
/// so a backend only needs to be internally consistent.
pub trait LogStore: Send + Sync {
    fn load_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;

    /// Atomically persist `operation` and the new `document` head, provided
    /// the stored head is still at `expected_sequence`.
    fn append(
        &self,
        document: &DocumentRecord,
        operation: &OperationRecord,
        expected_sequence: u64,
    ) -> Result<(), CommitError>;

    /// Overwrite a document head without logging an operation (status changes).
    fn put_document(&self, document: &DocumentRecord) -> Result<(), StoreError>;

    /// Up to `limit` operations with `sequence >= from`, ascending.
    fn read_operations(
        &self,
        id: DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    fn load_checkpoint(&self, id: DocumentId) -> Result<Option<Checkpoint>, StoreError>;

    /// Store `checkpoint` and delete every operation it covers. Returns the
    /// number of operations deleted.
    fn compact(&self, checkpoint: &Checkpoint) -> Result<u64, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Serialize and LZ4-compress a record.
pub(crate) fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Inverse of [`encode_blob`].
pub(crate) fn decode_blob<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
