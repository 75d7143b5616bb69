//! CRDT merge engine.
//!
//! Pure and synchronous: given a document's current `(state, clock)` and a
//! pending operation, compute the next `(state, clock)` and whether the
//! operation was concurrent with what the document already holds. The
//! result only becomes authoritative once the operation log sequences it.
//!
//! ```text
//!   observed ──increment(author)──► stamped
//!      │                               │
//!      └─ must be ≤ document clock     └─ compare(stamped, document)
//!                                           Greater     → fresh
//!                                           Less/Equal  → redundant (dot seen)
//!                                           Concurrent  → conflict
//! ```

use serde::{Deserialize, Serialize};

use crate::author::{AuthorId, AuthorNamespace};
use crate::clock::{ClockOrdering, VectorClock};
use crate::error::ValidationError;
use crate::merge::{Dot, MergeRegistry, OpContext};
use crate::payload::{DocumentState, OpPayload};

/// An operation as submitted, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub author: AuthorId,
    /// The document clock the author had seen when issuing the operation.
    pub observed: VectorClock,
    pub payload: OpPayload,
}

impl PendingOperation {
    pub fn new(author: impl Into<AuthorId>, observed: VectorClock, payload: OpPayload) -> Self {
        Self {
            author: author.into(),
            observed,
            payload,
        }
    }

    /// `increment(observed, author)`.
    pub fn stamped(&self) -> VectorClock {
        self.observed.increment(&self.author)
    }

    pub fn dot(&self) -> Dot {
        Dot {
            author: self.author.clone(),
            counter: self.observed.get(&self.author) + 1,
        }
    }
}

/// How an operation relates to the document it was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    /// The document had seen everything the author had; no concurrency.
    Fresh,
    /// The operation's dot was already folded in (a retry or duplicate).
    Redundant,
    /// The document holds operations the author had not seen.
    Concurrent,
}

/// Result of [`MergeEngine::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub state: DocumentState,
    pub clock: VectorClock,
    pub stamped: VectorClock,
    pub disposition: Disposition,
}

impl MergeOutcome {
    pub fn conflict(&self) -> bool {
        self.disposition == Disposition::Concurrent
    }
}

/// A logged operation, as fed back into [`MergeEngine::replay`].
#[derive(Debug, Clone, Copy)]
pub struct LoggedOp<'a> {
    pub author: &'a AuthorId,
    pub observed: &'a VectorClock,
    pub payload: &'a OpPayload,
}

/// Validates, classifies, and folds operations.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    registry: MergeRegistry,
    namespace: AuthorNamespace,
}

impl MergeEngine {
    pub fn new(registry: MergeRegistry, namespace: AuthorNamespace) -> Self {
        Self {
            registry,
            namespace,
        }
    }

    pub fn registry(&self) -> &MergeRegistry {
        &self.registry
    }

    pub fn namespace(&self) -> &AuthorNamespace {
        &self.namespace
    }

    /// Checks that do not depend on the document: author, clock entries,
    /// and payload shape.
    pub fn validate(&self, op: &PendingOperation) -> Result<(), ValidationError> {
        self.namespace.validate(&op.author)?;
        op.observed.validate(&self.namespace)?;
        let function = self.registry.get(&op.payload.kind())?;
        function.validate(&op.payload)
    }

    /// Classify `op` against `document`. Fails with `ClockAhead` when the
    /// author claims to have seen operations the document does not hold.
    pub fn classify(
        &self,
        document: &VectorClock,
        op: &PendingOperation,
    ) -> Result<Disposition, ValidationError> {
        if !op.observed.compare(document).is_le() {
            return Err(ValidationError::ClockAhead {
                observed: op.observed.clone(),
                document: document.clone(),
            });
        }
        Ok(match op.stamped().compare(document) {
            ClockOrdering::Greater => Disposition::Fresh,
            ClockOrdering::Less | ClockOrdering::Equal => Disposition::Redundant,
            ClockOrdering::Concurrent => Disposition::Concurrent,
        })
    }

    /// Compute the document's next state and clock. Does not mutate anything.
    pub fn apply(
        &self,
        state: &DocumentState,
        clock: &VectorClock,
        op: &PendingOperation,
    ) -> Result<MergeOutcome, ValidationError> {
        self.validate(op)?;
        let disposition = self.classify(clock, op)?;
        let stamped = op.stamped();
        let state = self.fold(state, &op.author, &stamped, &op.payload)?;
        let clock = clock.merge(&stamped);

        if disposition == Disposition::Concurrent {
            log::debug!(
                "concurrent op by {} (stamped {stamped}) against {clock}",
                op.author
            );
        }
        Ok(MergeOutcome {
            state,
            clock,
            stamped,
            disposition,
        })
    }

    /// Check a [`Disposition::Redundant`] operation against what the log
    /// holds at its dot. Only a resubmission of that same operation passes;
    /// `None` means the dot is no longer in the log (pruned) and is refused.
    pub fn check_retry(
        &self,
        op: &PendingOperation,
        logged: Option<LoggedOp<'_>>,
    ) -> Result<(), ValidationError> {
        let dot = op.dot();
        match logged {
            Some(logged)
                if *logged.author == op.author
                    && logged.observed.get(logged.author) + 1 == dot.counter
                    && *logged.payload == op.payload =>
            {
                Ok(())
            }
            _ => Err(ValidationError::DuplicateDot {
                author: dot.author,
                counter: dot.counter,
            }),
        }
    }

    /// Fold one operation with an already-stamped clock into `state`.
    pub fn fold(
        &self,
        state: &DocumentState,
        author: &AuthorId,
        stamped: &VectorClock,
        payload: &OpPayload,
    ) -> Result<DocumentState, ValidationError> {
        let kind = payload.kind();
        if let Some(current) = state.kind() {
            if current != kind {
                return Err(ValidationError::KindMismatch {
                    expected: current,
                    got: kind,
                });
            }
        }
        let function = self.registry.get(&kind)?;
        function.merge(state, &OpContext::new(author, stamped), payload)
    }

    /// Rebuild `(state, clock)` by folding logged operations, in sequence
    /// order, on top of a base (empty, or a compaction checkpoint).
    pub fn replay<'a, I>(
        &self,
        base_state: DocumentState,
        base_clock: VectorClock,
        ops: I,
    ) -> Result<(DocumentState, VectorClock), ValidationError>
    where
        I: IntoIterator<Item = LoggedOp<'a>>,
    {
        let mut state = base_state;
        let mut clock = base_clock;
        for op in ops {
            let stamped = op.observed.increment(op.author);
            state = self.fold(&state, op.author, &stamped, op.payload)?;
            clock.merge_from(&stamped);
        }
        Ok((state, clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::DocumentKind;

    fn vc(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(a, v)| (*a, *v)).collect()
    }

    fn add(author: &str, observed: VectorClock, delta: i64) -> PendingOperation {
        PendingOperation::new(author, observed, OpPayload::CounterAdd { delta })
    }

    #[test]
    fn test_first_op_on_fresh_document() {
        let engine = MergeEngine::default();
        let out = engine
            .apply(&DocumentState::Empty, &VectorClock::new(), &add("A", vc(&[]), 1))
            .unwrap();
        assert_eq!(out.clock, vc(&[("A", 1)]));
        assert_eq!(out.disposition, Disposition::Fresh);
        assert!(!out.conflict());
    }

    #[test]
    fn test_unaware_author_is_concurrent() {
        let engine = MergeEngine::default();
        let first = engine
            .apply(&DocumentState::Empty, &VectorClock::new(), &add("A", vc(&[]), 1))
            .unwrap();
        let second = engine
            .apply(&first.state, &first.clock, &add("B", vc(&[]), 2))
            .unwrap();
        assert!(second.conflict());
        assert_eq!(second.clock, vc(&[("A", 1), ("B", 1)]));
        assert_eq!(second.state.as_counter().unwrap().value(), 3);
    }

    #[test]
    fn test_retry_is_redundant_and_idempotent() {
        let engine = MergeEngine::default();
        let op = add("A", vc(&[]), 5);
        let first = engine
            .apply(&DocumentState::Empty, &VectorClock::new(), &op)
            .unwrap();
        let retry = engine.apply(&first.state, &first.clock, &op).unwrap();
        assert_eq!(retry.disposition, Disposition::Redundant);
        assert!(!retry.conflict());
        assert_eq!(retry.state, first.state);
        assert_eq!(retry.clock, first.clock);
    }

    #[test]
    fn test_same_dot_different_payload_is_refused() {
        let engine = MergeEngine::default();
        let first = add("A", vc(&[]), 1);
        let out = engine
            .apply(&DocumentState::Empty, &VectorClock::new(), &first)
            .unwrap();
        let logged = LoggedOp {
            author: &first.author,
            observed: &first.observed,
            payload: &first.payload,
        };

        // Same author, same observed clock, different delta.
        let second = add("A", vc(&[]), 5);
        let again = engine.apply(&out.state, &out.clock, &second).unwrap();
        assert_eq!(again.disposition, Disposition::Redundant);
        assert_eq!(again.state.as_counter().unwrap().value(), 1);
        assert_eq!(
            engine.check_retry(&second, Some(logged)),
            Err(ValidationError::DuplicateDot {
                author: "A".into(),
                counter: 1
            })
        );

        assert!(engine.check_retry(&first, Some(logged)).is_ok());
        assert!(engine.check_retry(&first, None).is_err());
    }

    #[test]
    fn test_clock_ahead_rejected() {
        let engine = MergeEngine::default();
        let err = engine
            .apply(&DocumentState::Empty, &VectorClock::new(), &add("A", vc(&[("B", 3)]), 1))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ClockAhead { .. }));
    }

    #[test]
    fn test_kind_fixed_by_first_op() {
        let engine = MergeEngine::default();
        let first = engine
            .apply(&DocumentState::Empty, &VectorClock::new(), &add("A", vc(&[]), 1))
            .unwrap();
        let op = PendingOperation::new(
            "A",
            first.clock.clone(),
            OpPayload::MapSet { key: "k".into(), value: "1".into() },
        );
        let err = engine.apply(&first.state, &first.clock, &op).unwrap_err();
        assert_eq!(
            err,
            ValidationError::KindMismatch {
                expected: DocumentKind::Counter,
                got: DocumentKind::Map,
            }
        );
    }

    #[test]
    fn test_namespace_enforced() {
        let engine = MergeEngine::new(
            MergeRegistry::with_defaults(),
            AuthorNamespace::with_prefixes(["user:"]),
        );
        let ok = add("user:1", vc(&[]), 1);
        assert!(engine.validate(&ok).is_ok());
        let bad_author = add("bot:1", vc(&[]), 1);
        assert!(matches!(
            engine.validate(&bad_author),
            Err(ValidationError::UnknownAuthor(_))
        ));
        let bad_clock = add("user:1", vc(&[("bot:9", 1)]), 1);
        assert!(engine.validate(&bad_clock).is_err());
    }

    #[test]
    fn test_replay_matches_incremental_apply() {
        let engine = MergeEngine::default();
        let ops = vec![
            add("A", vc(&[]), 1),
            add("B", vc(&[]), 2),
            add("A", vc(&[("A", 1), ("B", 1)]), 3),
            add("A", vc(&[]), 1),
        ];
        let mut state = DocumentState::Empty;
        let mut clock = VectorClock::new();
        for op in &ops {
            let out = engine.apply(&state, &clock, op).unwrap();
            state = out.state;
            clock = out.clock;
        }
        let logged = ops.iter().map(|op| LoggedOp {
            author: &op.author,
            observed: &op.observed,
            payload: &op.payload,
        });
        let (replayed, replayed_clock) = engine
            .replay(DocumentState::Empty, VectorClock::new(), logged)
            .unwrap();
        assert_eq!(replayed, state);
        assert_eq!(replayed_clock, clock);
        assert_eq!(state.as_counter().unwrap().value(), 6);
    }

    #[test]
    fn test_pending_dot() {
        let op = add("A", vc(&[("A", 2), ("B", 1)]), 1);
        assert_eq!(op.dot().counter, 3);
        assert_eq!(op.stamped(), vc(&[("A", 3), ("B", 1)]));
    }
}
