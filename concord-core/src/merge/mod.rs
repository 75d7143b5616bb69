//! Pluggable per-kind merge functions.
//!
//! Every [`DocumentKind`] maps to one [`MergeFunction`]. A merge function
//! folds a single operation into the current state and must be:
//!
//! - idempotent: folding the same operation (same dot) twice is a no-op,
//! - order-insensitive for concurrent operations: folding O1 then O2
//!   yields the same state as O2 then O1.
//!
//! Tie-breaks between concurrent writes use [`Stamp`], a total order that
//! extends the causal order of the operations' stamped clocks.

pub mod counter;
pub mod map;
pub mod text;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::author::AuthorId;
use crate::clock::VectorClock;
use crate::error::ValidationError;
use crate::payload::{DocumentKind, DocumentState, OpPayload};

pub use counter::{CounterMerge, PnCounter};
pub use map::{LwwEntry, LwwMap, LwwMapMerge};
pub use text::{TextMerge, TextState, TEXT_ROOT};

/// Unique identity of an operation: its author and that author's counter
/// in the operation's stamped clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    pub author: AuthorId,
    pub counter: u64,
}

/// Deterministic precedence of an operation for last-writer-wins fields.
///
/// Ordered by `(weight, author, counter)`. `weight` is the sum of the
/// stamped clock, which strictly grows along causal chains, so a causally
/// later write always wins; concurrent writes fall back to
/// `(author, counter)` ascending with the higher one winning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub weight: u64,
    pub author: AuthorId,
    pub counter: u64,
}

/// What a merge function knows about the operation it is folding.
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub author: &'a AuthorId,
    /// The operation's stamped clock: `increment(observed, author)`.
    pub clock: &'a VectorClock,
}

impl<'a> OpContext<'a> {
    pub fn new(author: &'a AuthorId, clock: &'a VectorClock) -> Self {
        Self { author, clock }
    }

    pub fn dot(&self) -> Dot {
        Dot {
            author: self.author.clone(),
            counter: self.clock.get(self.author),
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp {
            weight: self.clock.weight(),
            author: self.author.clone(),
            counter: self.clock.get(self.author),
        }
    }
}

/// A CRDT merge function for one document kind.
pub trait MergeFunction: Send + Sync {
    fn kind(&self) -> DocumentKind;

    /// Reject malformed payloads before anything is merged or logged.
    fn validate(&self, _payload: &OpPayload) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Fold `payload` into `state`. `state` is either `Empty` or of this
    /// function's kind.
    fn merge(
        &self,
        state: &DocumentState,
        ctx: &OpContext<'_>,
        payload: &OpPayload,
    ) -> Result<DocumentState, ValidationError>;
}

/// Merge function for `Custom` kinds built from a closure over raw bytes.
///
/// The closure receives the current bytes (`None` for an empty document),
/// the operation context, and the operation's bytes.
pub struct CustomMerge<F> {
    name: String,
    merge_fn: F,
}

impl<F> CustomMerge<F>
where
    F: Fn(Option<&[u8]>, &OpContext<'_>, &[u8]) -> Result<Vec<u8>, ValidationError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, merge_fn: F) -> Self {
        Self {
            name: name.into(),
            merge_fn,
        }
    }
}

impl<F> MergeFunction for CustomMerge<F>
where
    F: Fn(Option<&[u8]>, &OpContext<'_>, &[u8]) -> Result<Vec<u8>, ValidationError> + Send + Sync,
{
    fn kind(&self) -> DocumentKind {
        DocumentKind::Custom(self.name.clone())
    }

    fn merge(
        &self,
        state: &DocumentState,
        ctx: &OpContext<'_>,
        payload: &OpPayload,
    ) -> Result<DocumentState, ValidationError> {
        let data = match payload {
            OpPayload::Custom { data, .. } => data,
            other => {
                return Err(ValidationError::KindMismatch {
                    expected: self.kind(),
                    got: other.kind(),
                })
            }
        };
        let current = match state {
            DocumentState::Empty => None,
            DocumentState::Custom { data, .. } => Some(data.as_slice()),
            other => {
                return Err(ValidationError::KindMismatch {
                    expected: self.kind(),
                    got: other.kind().unwrap_or_else(|| self.kind()),
                })
            }
        };
        let merged = (self.merge_fn)(current, ctx, data)?;
        Ok(DocumentState::Custom {
            kind: self.name.clone(),
            data: merged,
        })
    }
}

/// Kind → merge function table.
#[derive(Clone)]
pub struct MergeRegistry {
    functions: HashMap<DocumentKind, Arc<dyn MergeFunction>>,
}

impl MergeRegistry {
    /// Registry with no merge functions.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registry with the built-in text, map, and counter functions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TextMerge));
        registry.register(Arc::new(LwwMapMerge));
        registry.register(Arc::new(CounterMerge));
        registry
    }

    /// Register (or replace) the function for its kind.
    pub fn register(&mut self, function: Arc<dyn MergeFunction>) -> Option<Arc<dyn MergeFunction>> {
        self.functions.insert(function.kind(), function)
    }

    pub fn get(&self, kind: &DocumentKind) -> Result<&Arc<dyn MergeFunction>, ValidationError> {
        self.functions
            .get(kind)
            .ok_or_else(|| ValidationError::UnsupportedKind(kind.clone()))
    }

    pub fn kinds(&self) -> Vec<DocumentKind> {
        self.functions.keys().cloned().collect()
    }
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Shared guard: `state` must be empty or of `kind`.
pub(crate) fn expect_kind(state: &DocumentState, kind: DocumentKind) -> Result<(), ValidationError> {
    match state.kind() {
        None => Ok(()),
        Some(k) if k == kind => Ok(()),
        Some(k) => Err(ValidationError::KindMismatch {
            expected: k,
            got: kind,
        }),
    }
}
