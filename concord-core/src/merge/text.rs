//! Rich-text documents backed by a Yjs (`yrs`) document.
//!
//! State is the full Yjs document encoded as a v1 update. An operation is a
//! v1 update produced by a client's local Yjs doc. Yjs updates are
//! idempotent and commute, which gives the engine convergence for free.

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use super::{expect_kind, MergeFunction, OpContext};
use crate::error::ValidationError;
use crate::payload::{DocumentKind, DocumentState, OpPayload};

/// Name of the root text type inside every text document.
pub const TEXT_ROOT: &str = "content";

/// Encoded Yjs state of a text document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextState {
    update: Vec<u8>,
}

impl TextState {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap an encoded Yjs state, checking that it decodes.
    pub fn from_update(update: Vec<u8>) -> Result<Self, ValidationError> {
        if !update.is_empty() {
            decode(&update)?;
        }
        Ok(Self { update })
    }

    /// Encoded full state (v1).
    pub fn encoded(&self) -> &[u8] {
        &self.update
    }

    /// Current plain-text content.
    pub fn text(&self) -> Result<String, ValidationError> {
        let doc = self.load(Doc::new())?;
        let txn = doc.transact();
        Ok(txn
            .get_text(TEXT_ROOT)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default())
    }

    /// Yjs state vector of this state.
    pub fn state_vector(&self) -> Result<StateVector, ValidationError> {
        let doc = self.load(Doc::new())?;
        let txn = doc.transact();
        Ok(txn.state_vector())
    }

    /// Fold a v1 update into this state.
    pub fn apply(&self, update: &[u8]) -> Result<TextState, ValidationError> {
        let doc = self.load(Doc::new())?;
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(decode(update)?)
                .map_err(|e| ValidationError::MalformedPayload(format!("text update: {e}")))?;
        }
        Ok(Self { update: encode_full(&doc) })
    }

    /// Build the update a client with `client_id` would send to insert
    /// `chunk` at byte offset `index` on top of this state.
    pub fn insert_update(
        &self,
        client_id: u64,
        index: u32,
        chunk: &str,
    ) -> Result<Vec<u8>, ValidationError> {
        let doc = self.load(Doc::with_client_id(client_id.into()))?;
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, index.min(len), chunk);
        }
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&before))
    }

    /// Build the update a client with `client_id` would send to remove
    /// `len` bytes starting at `index`.
    pub fn remove_update(
        &self,
        client_id: u64,
        index: u32,
        len: u32,
    ) -> Result<Vec<u8>, ValidationError> {
        let doc = self.load(Doc::with_client_id(client_id.into()))?;
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            let total = text.get_string(&txn).len() as u32;
            let start = index.min(total);
            let len = len.min(total - start);
            if len > 0 {
                text.remove_range(&mut txn, start, len);
            }
        }
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&before))
    }

    fn load(&self, doc: Doc) -> Result<Doc, ValidationError> {
        if !self.update.is_empty() {
            let mut txn = doc.transact_mut();
            txn.apply_update(decode(&self.update)?)
                .map_err(|e| ValidationError::MalformedPayload(format!("text state: {e}")))?;
        }
        Ok(doc)
    }
}

/// Two text states are equal when they hold the same content and the same
/// set of Yjs operations; byte encodings may differ.
impl PartialEq for TextState {
    fn eq(&self, other: &Self) -> bool {
        if self.update == other.update {
            return true;
        }
        match (
            self.text(),
            other.text(),
            self.state_vector(),
            other.state_vector(),
        ) {
            (Ok(a), Ok(b), Ok(sa), Ok(sb)) => a == b && sa == sb,
            _ => false,
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Update, ValidationError> {
    Update::decode_v1(bytes)
        .map_err(|e| ValidationError::MalformedPayload(format!("undecodable Yjs update: {e}")))
}

fn encode_full(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Merge function for [`DocumentKind::Text`].
pub struct TextMerge;

impl MergeFunction for TextMerge {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Text
    }

    fn validate(&self, payload: &OpPayload) -> Result<(), ValidationError> {
        match payload {
            OpPayload::Text { update } if update.is_empty() => {
                Err(ValidationError::MalformedPayload("empty text update".into()))
            }
            OpPayload::Text { update } => decode(update).map(|_| ()),
            other => Err(ValidationError::KindMismatch {
                expected: DocumentKind::Text,
                got: other.kind(),
            }),
        }
    }

    fn merge(
        &self,
        state: &DocumentState,
        _ctx: &OpContext<'_>,
        payload: &OpPayload,
    ) -> Result<DocumentState, ValidationError> {
        expect_kind(state, DocumentKind::Text)?;
        let update = match payload {
            OpPayload::Text { update } => update,
            other => {
                return Err(ValidationError::KindMismatch {
                    expected: DocumentKind::Text,
                    got: other.kind(),
                })
            }
        };
        let current = state.as_text().cloned().unwrap_or_default();
        Ok(DocumentState::Text(current.apply(update)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::author::AuthorId;
    use crate::clock::VectorClock;

    fn ctx_parts() -> (AuthorId, VectorClock) {
        let a = AuthorId::from("a");
        let clock = VectorClock::new().increment(&a);
        (a, clock)
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(TextState::empty().text().unwrap(), "");
    }

    #[test]
    fn test_insert_and_apply() {
        let base = TextState::empty();
        let update = base.insert_update(1, 0, "hello").unwrap();
        let next = base.apply(&update).unwrap();
        assert_eq!(next.text().unwrap(), "hello");

        let update = next.insert_update(1, 5, " world").unwrap();
        let next = next.apply(&update).unwrap();
        assert_eq!(next.text().unwrap(), "hello world");
    }

    #[test]
    fn test_remove_update() {
        let base = TextState::empty();
        let s = base.apply(&base.insert_update(1, 0, "abcdef").unwrap()).unwrap();
        let s = s.apply(&s.remove_update(1, 1, 3).unwrap()).unwrap();
        assert_eq!(s.text().unwrap(), "aef");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let base = TextState::empty();
        let update = base.insert_update(7, 0, "once").unwrap();
        let once = base.apply(&update).unwrap();
        let twice = once.apply(&update).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.text().unwrap(), "once");
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let base = TextState::empty();
        let ua = base.insert_update(1, 0, "AAA").unwrap();
        let ub = base.insert_update(2, 0, "BBB").unwrap();

        let ab = base.apply(&ua).unwrap().apply(&ub).unwrap();
        let ba = base.apply(&ub).unwrap().apply(&ua).unwrap();
        assert_eq!(ab.text().unwrap(), ba.text().unwrap());
        assert_eq!(ab, ba);
        assert_eq!(ab.text().unwrap().len(), 6);
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let f = TextMerge;
        assert!(f.validate(&OpPayload::Text { update: vec![] }).is_err());
        assert!(matches!(
            f.validate(&OpPayload::Text { update: vec![0xFF; 16] }),
            Err(ValidationError::MalformedPayload(_))
        ));
        assert!(matches!(
            f.validate(&OpPayload::CounterAdd { delta: 1 }),
            Err(ValidationError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_function_folds_into_empty() {
        let (a, clock) = ctx_parts();
        let ctx = OpContext::new(&a, &clock);
        let update = TextState::empty().insert_update(3, 0, "hi").unwrap();
        let state = TextMerge
            .merge(&DocumentState::Empty, &ctx, &OpPayload::Text { update })
            .unwrap();
        assert_eq!(state.as_text().unwrap().text().unwrap(), "hi");
    }

    #[test]
    fn test_merge_rejects_other_state_kind() {
        let (a, clock) = ctx_parts();
        let ctx = OpContext::new(&a, &clock);
        let update = TextState::empty().insert_update(3, 0, "hi").unwrap();
        let result = TextMerge.merge(
            &DocumentState::Counter(Default::default()),
            &ctx,
            &OpPayload::Text { update },
        );
        assert!(matches!(result, Err(ValidationError::KindMismatch { .. })));
    }
}
