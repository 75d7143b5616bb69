//! Per-author PN-counter.
//!
//! Each author owns one contribution. An author's operations always arrive
//! in dot order (its next operation observes the previous one), so a
//! contribution only needs the last applied dot counter to stay idempotent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{expect_kind, MergeFunction, OpContext};
use crate::author::AuthorId;
use crate::error::ValidationError;
use crate::payload::{DocumentKind, DocumentState, OpPayload};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// Dot counter of the last operation folded in.
    pub last_counter: u64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    contributions: BTreeMap<AuthorId, Contribution>,
}

impl PnCounter {
    pub fn value(&self) -> i64 {
        self.contributions
            .values()
            .fold(0i64, |acc, c| acc.saturating_add(c.total))
    }

    pub fn contribution(&self, author: &AuthorId) -> Option<Contribution> {
        self.contributions.get(author).copied()
    }

    /// Fold `delta` for dot `(author, counter)`. Returns `false` if that dot
    /// (or a later one from the same author) was already applied.
    pub fn apply(&mut self, author: &AuthorId, counter: u64, delta: i64) -> bool {
        let entry = self.contributions.entry(author.clone()).or_default();
        if counter <= entry.last_counter {
            return false;
        }
        entry.last_counter = counter;
        entry.total = entry.total.saturating_add(delta);
        true
    }
}

/// Merge function for [`DocumentKind::Counter`].
pub struct CounterMerge;

impl MergeFunction for CounterMerge {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Counter
    }

    fn validate(&self, payload: &OpPayload) -> Result<(), ValidationError> {
        match payload {
            OpPayload::CounterAdd { .. } => Ok(()),
            other => Err(ValidationError::KindMismatch {
                expected: DocumentKind::Counter,
                got: other.kind(),
            }),
        }
    }

    fn merge(
        &self,
        state: &DocumentState,
        ctx: &OpContext<'_>,
        payload: &OpPayload,
    ) -> Result<DocumentState, ValidationError> {
        expect_kind(state, DocumentKind::Counter)?;
        let delta = match payload {
            OpPayload::CounterAdd { delta } => *delta,
            other => {
                return Err(ValidationError::KindMismatch {
                    expected: DocumentKind::Counter,
                    got: other.kind(),
                })
            }
        };
        let mut counter = state.as_counter().cloned().unwrap_or_default();
        let dot = ctx.dot();
        counter.apply(&dot.author, dot.counter, delta);
        Ok(DocumentState::Counter(counter))
    }
}
