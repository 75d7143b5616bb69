//! Error types for storage, the engine facade, the wire protocol, and
//! configuration loading.

use std::path::PathBuf;
use thiserror::Error;

use concord_core::{DocumentId, ValidationError};
use serde::{Deserialize, Serialize};

/// Storage layer failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("document not found: {0}")]
    NotFound(DocumentId),

    /// The backend refused the write (e.g. it is shutting down).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Why a compare-and-append did not commit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommitError {
    /// Another operation took the sequence number first.
    #[error("commit race lost: expected sequence {expected}, document is at {actual}")]
    RaceLost { expected: u64, actual: u64 },

    /// The document was locked after the merge was computed.
    #[error("document {0} is locked")]
    Locked(DocumentId),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Rejected before merge; resync via replay and resubmit.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("rate limited: {remaining} writes remaining, window resets in {reset_secs}s")]
    RateLimited { remaining: u32, reset_secs: u64 },

    /// Retries exhausted; safe to resubmit the same operation.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The requested range was folded into a checkpoint.
    #[error("sequence {requested} was pruned; first available is {first_available}")]
    Pruned { requested: u64, first_available: u64 },

    #[error("document {0} is locked")]
    Locked(DocumentId),

    #[error("document {0} not found")]
    NotFound(DocumentId),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Validation(_) => ErrorCode::Validation,
            SyncError::RateLimited { .. } => ErrorCode::RateLimited,
            SyncError::Transient(_) => ErrorCode::Transient,
            SyncError::Pruned { .. } => ErrorCode::Pruned,
            SyncError::Locked(_) => ErrorCode::Locked,
            SyncError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    /// Seconds the caller should wait before retrying, if known.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SyncError::RateLimited { reset_secs, .. } => Some(*reset_secs),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::Transient(other.to_string()),
        }
    }
}

/// Error category carried in wire error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    RateLimited,
    Transient,
    Pruned,
    Locked,
    NotFound,
    /// The frame could not be decoded or was not valid in this state.
    BadRequest,
}

/// Wire protocol and connection errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("unexpected message: {0}")]
    Unexpected(String),

    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("connection closed")]
    Closed,

    #[error("timed out waiting for server")]
    Timeout,

    /// The server answered a request with an error frame.
    #[error("server rejected request ({code:?}): {message}")]
    Rejected {
        code: ErrorCode,
        message: String,
        reset_secs: Option<u64>,
    },
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {0} referenced in config is not set")]
    MissingEnv(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_to_transient() {
        let err: SyncError = StoreError::Database("disk full".into()).into();
        assert_eq!(err.code(), ErrorCode::Transient);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let id = DocumentId::new_v4();
        let err: SyncError = StoreError::NotFound(id).into();
        assert_eq!(err, SyncError::NotFound(id));
    }

    #[test]
    fn test_rate_limited_carries_hint() {
        let err = SyncError::RateLimited { remaining: 0, reset_secs: 42 };
        assert_eq!(err.retry_after(), Some(42));
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[test]
    fn test_validation_passthrough() {
        let err: SyncError = ValidationError::MalformedPayload("bad".into()).into();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(err.to_string(), "malformed payload: bad");
    }
}
