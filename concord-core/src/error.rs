//! Validation errors raised before any merge is attempted.

use thiserror::Error;

use crate::author::AuthorId;
use crate::clock::VectorClock;
use crate::payload::DocumentKind;

/// A request the engine refuses synchronously.
///
/// Never retried by the engine; the client must resync (replay) and resubmit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed author id: {0}")]
    MalformedAuthor(String),

    /// Author outside the configured namespace.
    #[error("author {0} is outside the allowed namespace")]
    UnknownAuthor(AuthorId),

    /// The client's observed clock knows operations the document does not.
    #[error("observed clock {observed} is ahead of document clock {document}")]
    ClockAhead {
        observed: VectorClock,
        document: VectorClock,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payload kind {got} does not match document kind {expected}")]
    KindMismatch {
        expected: DocumentKind,
        got: DocumentKind,
    },

    #[error("no merge function registered for kind {0}")]
    UnsupportedKind(DocumentKind),

    /// Two different operations from one author on the same observed clock.
    /// Only the first one can be folded in; the author must resync.
    #[error("operation by {author} reuses dot {counter} held by a different operation")]
    DuplicateDot { author: AuthorId, counter: u64 },
}
