//! Vector clocks: per-author logical counters with a causal partial order.
//!
//! ```text
//!   {A:2, B:1}  vs  {A:2, B:3}   → Less        (right saw everything left saw)
//!   {A:2}       vs  {B:1}        → Concurrent  (neither dominates)
//!   merge       = pointwise max  → {A:2, B:3}
//! ```
//!
//! Entries with a zero counter are never stored, so `{A:0}` and `{}` are the
//! same clock. Keys are kept in a `BTreeMap` so encoding is deterministic.
//!
//! Complexity: compare/merge O(a + b), increment O(log n).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::author::{AuthorId, AuthorNamespace};
use crate::error::ValidationError;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockOrdering {
    Equal,
    /// Left happened-before right.
    Less,
    /// Right happened-before left.
    Greater,
    Concurrent,
}

impl ClockOrdering {
    /// Left is causally at or before right.
    pub fn is_le(self) -> bool {
        matches!(self, ClockOrdering::Equal | ClockOrdering::Less)
    }
}

/// Mapping from author to a monotonically increasing counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<AuthorId, u64>", into = "BTreeMap<AuthorId, u64>")]
pub struct VectorClock {
    entries: BTreeMap<AuthorId, u64>,
}

impl From<BTreeMap<AuthorId, u64>> for VectorClock {
    fn from(mut entries: BTreeMap<AuthorId, u64>) -> Self {
        entries.retain(|_, v| *v > 0);
        Self { entries }
    }
}

impl From<VectorClock> for BTreeMap<AuthorId, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.entries
    }
}

impl<A: Into<AuthorId>> FromIterator<(A, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (A, u64)>>(iter: I) -> Self {
        let entries: BTreeMap<AuthorId, u64> =
            iter.into_iter().map(|(a, v)| (a.into(), v)).collect();
        Self::from(entries)
    }
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `author` (0 when absent).
    pub fn get(&self, author: &AuthorId) -> u64 {
        self.entries.get(author).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AuthorId, u64)> {
        self.entries.iter().map(|(a, v)| (a, *v))
    }

    pub fn authors(&self) -> impl Iterator<Item = &AuthorId> {
        self.entries.keys()
    }

    /// Sum of all counters. Strictly increases along every causal chain.
    pub fn weight(&self) -> u64 {
        self.entries.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Standard vector-clock partial order.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for (author, v) in &self.entries {
            let o = other.get(author);
            if *v < o {
                less = true;
            } else if *v > o {
                greater = true;
            }
        }
        // Authors only present on the right side.
        if other.entries.keys().any(|a| !self.entries.contains_key(a)) {
            less = true;
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Less,
            (false, true) => ClockOrdering::Greater,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Pointwise maximum over the union of authors.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge_from(other);
        out
    }

    /// In-place pointwise maximum.
    pub fn merge_from(&mut self, other: &VectorClock) {
        for (author, v) in &other.entries {
            let entry = self.entries.entry(author.clone()).or_insert(0);
            *entry = (*entry).max(*v);
        }
    }

    /// Copy of this clock with `author`'s counter advanced by one.
    pub fn increment(&self, author: &AuthorId) -> VectorClock {
        let mut out = self.clone();
        out.tick(author);
        out
    }

    /// Advance `author`'s counter by one, returning the new value.
    pub fn tick(&mut self, author: &AuthorId) -> u64 {
        let entry = self.entries.entry(author.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Reject clocks naming authors outside `namespace`.
    pub fn validate(&self, namespace: &AuthorNamespace) -> Result<(), ValidationError> {
        for author in self.entries.keys() {
            namespace.validate(author)?;
        }
        Ok(())
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (author, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{author}:{v}")?;
        }
        f.write_str("}")
    }
}
