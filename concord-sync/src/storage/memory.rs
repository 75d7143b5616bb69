//! In-memory [`LogStore`], used when no storage path is configured and in
//! tests. Supports injecting append failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use concord_core::DocumentId;

use super::{Checkpoint, DocumentRecord, LogStore, OperationRecord};
use crate::error::{CommitError, StoreError};

#[derive(Default)]
struct Inner {
    documents: HashMap<DocumentId, DocumentRecord>,
    operations: HashMap<DocumentId, BTreeMap<u64, OperationRecord>>,
    checkpoints: HashMap<DocumentId, Checkpoint>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    failing_appends: AtomicU32,
    operation_reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with a storage error.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Total operations currently held, across documents.
    pub fn operation_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.operations.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Calls to `read_operations` so far.
    pub fn operation_reads(&self) -> u64 {
        self.operation_reads.load(Ordering::Relaxed)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl LogStore for MemoryStore {
    fn load_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.read()?.documents.keys().copied().collect())
    }

    fn append(
        &self,
        document: &DocumentRecord,
        operation: &OperationRecord,
        expected_sequence: u64,
    ) -> Result<(), CommitError> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected append failure".into()).into());
        }
        let mut inner = self.write()?;
        let actual = inner
            .documents
            .get(&document.id)
            .map_or(0, |d| d.sequence);
        if actual != expected_sequence {
            return Err(CommitError::RaceLost {
                expected: expected_sequence,
                actual,
            });
        }
        inner
            .operations
            .entry(document.id)
            .or_default()
            .insert(operation.sequence, operation.clone());
        inner.documents.insert(document.id, document.clone());
        Ok(())
    }

    fn put_document(&self, document: &DocumentRecord) -> Result<(), StoreError> {
        self.write()?.documents.insert(document.id, document.clone());
        Ok(())
    }

    fn read_operations(
        &self,
        id: DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        self.operation_reads.fetch_add(1, Ordering::Relaxed);
        let inner = self.read()?;
        Ok(inner
            .operations
            .get(&id)
            .map(|ops| ops.range(from..).take(limit).map(|(_, op)| op.clone()).collect())
            .unwrap_or_default())
    }

    fn load_checkpoint(&self, id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.read()?.checkpoints.get(&id).cloned())
    }

    fn compact(&self, checkpoint: &Checkpoint) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let removed = match inner.operations.get_mut(&checkpoint.document_id) {
            Some(ops) => {
                let kept = ops.split_off(&(checkpoint.sequence + 1));
                let removed = ops.len() as u64;
                *ops = kept;
                removed
            }
            None => 0,
        };
        inner
            .checkpoints
            .insert(checkpoint.document_id, checkpoint.clone());
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use concord_core::{DocumentState, OpPayload, PendingOperation, VectorClock};

    fn op(doc: DocumentId, seq: u64) -> OperationRecord {
        let pending = PendingOperation::new("a", VectorClock::new(), OpPayload::CounterAdd { delta: 1 });
        OperationRecord::new(doc, seq, &pending, Utc::now(), false)
    }

    fn head(doc: DocumentId, seq: u64) -> DocumentRecord {
        let mut record = DocumentRecord::empty(doc, Utc::now());
        record.sequence = seq;
        record
    }

    #[test]
    fn test_append_and_read() {
        let store = MemoryStore::new();
        let doc = DocumentId::new_v4();
        for seq in 1..=5 {
            store.append(&head(doc, seq), &op(doc, seq), seq - 1).unwrap();
        }
        let ops = store.read_operations(doc, 3, 10).unwrap();
        assert_eq!(ops.iter().map(|o| o.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(store.operation_reads(), 1);
        assert_eq!(store.load_document(doc).unwrap().unwrap().sequence, 5);
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
    }

    #[test]
    fn test_append_detects_race() {
        let store = MemoryStore::new();
        let doc = DocumentId::new_v4();
        store.append(&head(doc, 1), &op(doc, 1), 0).unwrap();
        let err = store.append(&head(doc, 1), &op(doc, 1), 0).unwrap_err();
        assert_eq!(err, CommitError::RaceLost { expected: 0, actual: 1 });
    }

    #[test]
    fn test_injected_failure_leaves_no_trace() {
        let store = MemoryStore::new();
        let doc = DocumentId::new_v4();
        store.fail_next_appends(1);
        assert!(matches!(
            store.append(&head(doc, 1), &op(doc, 1), 0),
            Err(CommitError::Storage(_))
        ));
        assert!(store.load_document(doc).unwrap().is_none());
        assert_eq!(store.operation_count(), 0);
        store.append(&head(doc, 1), &op(doc, 1), 0).unwrap();
    }

    #[test]
    fn test_compact_removes_prefix() {
        let store = MemoryStore::new();
        let doc = DocumentId::new_v4();
        for seq in 1..=6 {
            store.append(&head(doc, seq), &op(doc, seq), seq - 1).unwrap();
        }
        let checkpoint = Checkpoint {
            document_id: doc,
            sequence: 4,
            state: DocumentState::Empty,
            clock: VectorClock::new(),
            created_at: Utc::now(),
        };
        assert_eq!(store.compact(&checkpoint).unwrap(), 4);
        let ops = store.read_operations(doc, 0, 100).unwrap();
        assert_eq!(ops.iter().map(|o| o.sequence).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(store.load_checkpoint(doc).unwrap().unwrap().sequence, 4);
    }

    #[test]
    fn test_read_limit() {
        let store = MemoryStore::new();
        let doc = DocumentId::new_v4();
        for seq in 1..=10 {
            store.append(&head(doc, seq), &op(doc, seq), seq - 1).unwrap();
        }
        assert_eq!(store.read_operations(doc, 1, 3).unwrap().len(), 3);
        assert!(store.read_operations(DocumentId::new_v4(), 0, 3).unwrap().is_empty());
    }
}
