//! Last-writer-wins map for structured metadata fields.
//!
//! Each key keeps the value and [`Stamp`] of the winning write. Deletes are
//! tombstones so that a concurrent set/delete pair resolves the same way in
//! either arrival order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{expect_kind, MergeFunction, OpContext, Stamp};
use crate::error::ValidationError;
use crate::payload::{DocumentKind, DocumentState, OpPayload};

/// Maximum key length accepted in a map operation.
pub const MAX_KEY_LEN: usize = 256;

/// Winning write for one key. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwEntry {
    pub value: Option<String>,
    pub stamp: Stamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwMap {
    entries: BTreeMap<String, LwwEntry>,
}

impl LwwMap {
    /// Live value (JSON text) for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|e| e.value.as_deref())
    }

    /// Entry for `key`, tombstones included.
    pub fn entry(&self, key: &str) -> Option<&LwwEntry> {
        self.entries.get(key)
    }

    /// Live (non-deleted) key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_deref().map(|v| (k.as_str(), v)))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a write. Returns `true` if it won.
    pub fn apply(&mut self, key: &str, value: Option<String>, stamp: Stamp) -> bool {
        match self.entries.get(key) {
            Some(existing) if existing.stamp >= stamp => false,
            _ => {
                self.entries.insert(key.to_string(), LwwEntry { value, stamp });
                true
            }
        }
    }
}

/// Merge function for [`DocumentKind::Map`].
pub struct LwwMapMerge;

fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::MalformedPayload("empty map key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::MalformedPayload(format!(
            "map key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

impl MergeFunction for LwwMapMerge {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Map
    }

    fn validate(&self, payload: &OpPayload) -> Result<(), ValidationError> {
        match payload {
            OpPayload::MapSet { key, value } => {
                validate_key(key)?;
                serde_json::from_str::<serde_json::Value>(value).map_err(|e| {
                    ValidationError::MalformedPayload(format!("value for {key} is not JSON: {e}"))
                })?;
                Ok(())
            }
            OpPayload::MapDelete { key } => validate_key(key),
            other => Err(ValidationError::KindMismatch {
                expected: DocumentKind::Map,
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
        expect_kind(state, DocumentKind::Map)?;
        let mut map = state.as_map().cloned().unwrap_or_default();
        let (key, value) = match payload {
            OpPayload::MapSet { key, value } => (key, Some(value.clone())),
            OpPayload::MapDelete { key } => (key, None),
            other => {
                return Err(ValidationError::KindMismatch {
                    expected: DocumentKind::Map,
                    got: other.kind(),
                })
            }
        };
        if !map.apply(key, value, ctx.stamp()) {
            log::trace!("map write to {key} by {} lost to an existing stamp", ctx.author);
        }
        Ok(DocumentState::Map(map))
    }
}
