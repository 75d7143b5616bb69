//! Per-document operation log.
//!
//! The log owns every document head. Writers for one document are serialized
//! on a per-document async mutex at `append`; different documents never
//! contend. Readers see either the head before or after an append, never a
//! partial write, because the store commits operation and head together.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use concord_core::{
    DocumentId, DocumentState, Dot, MergeEngine, MergeOutcome, PendingOperation, VectorClock,
};

use crate::error::{CommitError, StoreError, SyncError};
use crate::storage::{Checkpoint, DocumentRecord, DocumentStatus, LogStore, OperationRecord};
use crate::time::Clock;

/// Counters exposed through [`OperationLog::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub appends: u64,
    pub races_lost: u64,
    pub storage_failures: u64,
    pub operations_pruned: u64,
}

#[derive(Default)]
struct AtomicLogStats {
    appends: AtomicU64,
    races_lost: AtomicU64,
    storage_failures: AtomicU64,
    operations_pruned: AtomicU64,
}

/// Result of [`OperationLog::prune`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    /// The document was written to within the recent-activity window.
    RecentlyActive,
    /// Nothing older than the cutoff was left in the log.
    NothingToPrune,
    Pruned { removed: u64, checkpoint_sequence: u64 },
}

pub struct OperationLog {
    store: Arc<dyn LogStore>,
    engine: Arc<MergeEngine>,
    locks: RwLock<HashMap<DocumentId, Arc<Mutex<()>>>>,
    clock: Arc<dyn Clock>,
    page_size: usize,
    stats: AtomicLogStats,
}

impl OperationLog {
    pub fn new(
        store: Arc<dyn LogStore>,
        engine: Arc<MergeEngine>,
        clock: Arc<dyn Clock>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            engine,
            locks: RwLock::new(HashMap::new()),
            clock,
            page_size: page_size.max(1),
            stats: AtomicLogStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    /// Serialization slot for `id`, created on first use.
    async fn document_lock(&self, id: DocumentId) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&id) {
                return lock.clone();
            }
        }
        let mut locks = self.locks.write().await;
        locks.entry(id).or_default().clone()
    }

    /// Current head of `id`. Documents nobody has written to yet read as
    /// empty at sequence 0.
    pub fn head(&self, id: DocumentId) -> Result<DocumentRecord, StoreError> {
        Ok(self
            .store
            .load_document(id)?
            .unwrap_or_else(|| DocumentRecord::empty(id, self.clock.now())))
    }

    /// `(state, clock, sequence)` of the latest committed head.
    pub fn latest_state(
        &self,
        id: DocumentId,
    ) -> Result<(DocumentState, VectorClock, u64), StoreError> {
        let head = self.head(id)?;
        Ok((head.state, head.clock, head.sequence))
    }

    /// Commit `op` with its precomputed merge `outcome`, provided the head is
    /// still at `expected_sequence`. Waits for the document's slot.
    pub async fn append(
        &self,
        id: DocumentId,
        op: &PendingOperation,
        outcome: &MergeOutcome,
        expected_sequence: u64,
    ) -> Result<OperationRecord, CommitError> {
        let lock = self.document_lock(id).await;
        let _slot = lock.lock().await;

        let current = self.head(id)?;
        if current.status == DocumentStatus::Locked {
            return Err(CommitError::Locked(id));
        }
        if current.sequence != expected_sequence {
            self.stats.races_lost.fetch_add(1, Ordering::Relaxed);
            return Err(CommitError::RaceLost {
                expected: expected_sequence,
                actual: current.sequence,
            });
        }

        let now = self.clock.now();
        let sequence = expected_sequence + 1;
        let record = OperationRecord::new(id, sequence, op, now, outcome.conflict());
        let head = DocumentRecord {
            id,
            state: outcome.state.clone(),
            clock: outcome.clock.clone(),
            sequence,
            status: current.status,
            created_at: current.created_at,
            updated_at: now,
        };

        match self.store.append(&head, &record, expected_sequence) {
            Ok(()) => {
                self.stats.appends.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Committed {} #{sequence} on {id} by {} (clock {})",
                    record.operation_type,
                    record.author,
                    head.clock
                );
                Ok(record)
            }
            Err(e) => {
                match &e {
                    CommitError::RaceLost { .. } => {
                        self.stats.races_lost.fetch_add(1, Ordering::Relaxed);
                    }
                    CommitError::Storage(err) => {
                        self.stats.storage_failures.fetch_add(1, Ordering::Relaxed);
                        log::error!("Append #{sequence} on {id} failed: {err}");
                    }
                    CommitError::Locked(_) => {}
                }
                Err(e)
            }
        }
    }

    fn ensure_available(&self, id: DocumentId, from: u64) -> Result<(), SyncError> {
        if let Some(checkpoint) = self.store.load_checkpoint(id)? {
            if from <= checkpoint.sequence {
                return Err(SyncError::Pruned {
                    requested: from,
                    first_available: checkpoint.first_available(),
                });
            }
        }
        Ok(())
    }

    /// Up to `limit` operations starting at `from`, ascending.
    pub fn replay_page(
        &self,
        id: DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, SyncError> {
        self.ensure_available(id, from)?;
        let page = self.store.read_operations(id, from.max(1), limit)?;
        // A prune may have run between the check and the read.
        if let Some(first) = page.first() {
            if first.sequence > from.max(1) {
                return Err(SyncError::Pruned {
                    requested: from,
                    first_available: first.sequence,
                });
            }
        }
        Ok(page)
    }

    /// Lazy replay of every operation from `from` up to the head as it was
    /// when the call was made. Pages are fetched on demand; calling again
    /// with a later `from` resumes where a previous stream stopped.
    pub fn replay(
        self: &Arc<Self>,
        id: DocumentId,
        from: u64,
    ) -> Result<impl Stream<Item = Result<OperationRecord, SyncError>> + Send + 'static, SyncError>
    {
        self.ensure_available(id, from)?;
        let until = self.head(id)?.sequence;

        struct Cursor {
            log: Arc<OperationLog>,
            next: u64,
            until: u64,
            buffer: VecDeque<OperationRecord>,
            failed: bool,
        }

        let cursor = Cursor {
            log: self.clone(),
            next: from.max(1),
            until,
            buffer: VecDeque::new(),
            failed: false,
        };

        Ok(stream::unfold(cursor, move |mut cursor| async move {
            if cursor.failed {
                return None;
            }
            if cursor.buffer.is_empty() {
                if cursor.next > cursor.until {
                    return None;
                }
                let remaining = (cursor.until - cursor.next + 1) as usize;
                let limit = remaining.min(cursor.log.page_size);
                match cursor.log.replay_page(id, cursor.next, limit) {
                    Ok(page) if page.is_empty() => return None,
                    Ok(page) => cursor.buffer.extend(page),
                    Err(e) => {
                        cursor.failed = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
            let op = cursor.buffer.pop_front()?;
            cursor.next = op.sequence + 1;
            Some((Ok(op), cursor))
        }))
    }

    /// The logged operation that introduced `dot`, searching back from the
    /// head. `None` when the dot was never logged or has been pruned.
    ///
    /// Operations by one author that are not redundant carry strictly
    /// increasing dots in log order, so the scan stops at the first
    /// operation by that author with a smaller dot.
    pub fn find_dot(&self, id: DocumentId, dot: &Dot) -> Result<Option<OperationRecord>, StoreError> {
        let floor = self.store.load_checkpoint(id)?.map_or(1, |cp| cp.first_available());
        let mut end = self.head(id)?.sequence;
        while end >= floor {
            let start = end.saturating_sub(self.page_size as u64 - 1).max(floor);
            let page = self.store.read_operations(id, start, (end - start + 1) as usize)?;
            for op in page.into_iter().rev() {
                if op.author != dot.author {
                    continue;
                }
                let counter = op.clock.get(&op.author) + 1;
                if counter == dot.counter {
                    return Ok(Some(op));
                }
                if counter < dot.counter {
                    return Ok(None);
                }
            }
            end = start - 1;
        }
        Ok(None)
    }

    /// Drop per-document slots nobody is holding or waiting on. Returns
    /// how many were removed.
    pub async fn remove_idle_locks(&self) -> usize {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn lock_count(&self) -> usize {
        self.locks.read().await.len()
    }

    pub fn checkpoint(&self, id: DocumentId) -> Result<Option<Checkpoint>, StoreError> {
        self.store.load_checkpoint(id)
    }

    /// Set the workflow status of an existing document.
    pub async fn set_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
    ) -> Result<DocumentRecord, SyncError> {
        let lock = self.document_lock(id).await;
        let _slot = lock.lock().await;

        let mut head = self.store.load_document(id)?.ok_or(SyncError::NotFound(id))?;
        if head.status != status {
            log::info!("Document {id} status {:?} -> {status:?}", head.status);
            head.status = status;
            self.store.put_document(&head)?;
        }
        Ok(head)
    }

    /// Fold operations applied before `cutoff` into the document's
    /// checkpoint and delete them, unless the document was updated at or
    /// after `idle_since`.
    pub async fn prune(
        &self,
        id: DocumentId,
        cutoff: DateTime<Utc>,
        idle_since: DateTime<Utc>,
    ) -> Result<PruneOutcome, SyncError> {
        let lock = self.document_lock(id).await;
        let _slot = lock.lock().await;

        let Some(head) = self.store.load_document(id)? else {
            return Ok(PruneOutcome::NothingToPrune);
        };
        if head.updated_at >= idle_since {
            return Ok(PruneOutcome::RecentlyActive);
        }

        let base = self.store.load_checkpoint(id)?;
        let (mut base_seq, base_state, base_clock) = match &base {
            Some(cp) => (cp.sequence, cp.state.clone(), cp.clock.clone()),
            None => (0, DocumentState::Empty, VectorClock::new()),
        };

        let mut expired = Vec::new();
        'scan: loop {
            let page = self.store.read_operations(id, base_seq + 1, self.page_size)?;
            if page.is_empty() {
                break;
            }
            for op in page {
                if op.applied_at >= cutoff {
                    break 'scan;
                }
                base_seq = op.sequence;
                expired.push(op);
            }
        }

        let Some(last) = expired.last() else {
            return Ok(PruneOutcome::NothingToPrune);
        };
        let checkpoint_sequence = last.sequence;
        let (state, clock) = self
            .engine
            .replay(base_state, base_clock, expired.iter().map(OperationRecord::logged))?;
        let checkpoint = Checkpoint {
            document_id: id,
            sequence: checkpoint_sequence,
            state,
            clock,
            created_at: self.clock.now(),
        };
        let removed = self.store.compact(&checkpoint)?;
        self.stats.operations_pruned.fetch_add(removed, Ordering::Relaxed);
        log::info!("Pruned {removed} operations on {id} through #{checkpoint_sequence}");
        Ok(PruneOutcome::Pruned {
            removed,
            checkpoint_sequence,
        })
    }

    pub fn documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.store.list_documents()
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            appends: self.stats.appends.load(Ordering::Relaxed),
            races_lost: self.stats.races_lost.load(Ordering::Relaxed),
            storage_failures: self.stats.storage_failures.load(Ordering::Relaxed),
            operations_pruned: self.stats.operations_pruned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::time::ManualClock;
    use chrono::Duration;
    use concord_core::OpPayload;
    use futures_util::StreamExt;

    fn log_with(page_size: usize) -> (Arc<ManualClock>, Arc<MemoryStore>, Arc<OperationLog>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(OperationLog::new(
            store.clone(),
            Arc::new(MergeEngine::default()),
            clock.clone(),
            page_size,
        ));
        (clock, store, log)
    }

    /// Append one counter increment by `author` observing the current head.
    async fn add(log: &OperationLog, id: DocumentId, author: &str, delta: i64) -> OperationRecord {
        let head = log.head(id).unwrap();
        let op = PendingOperation::new(author, head.clock.clone(), OpPayload::CounterAdd { delta });
        let outcome = log.engine().apply(&head.state, &head.clock, &op).unwrap();
        log.append(id, &op, &outcome, head.sequence).await.unwrap()
    }

    #[tokio::test]
    async fn test_sequences_are_gapless() {
        let (_clock, _store, log) = log_with(4);
        let doc = DocumentId::new_v4();
        for expected in 1..=6 {
            assert_eq!(add(&log, doc, "a", 1).await.sequence, expected);
        }
        let (state, clock, seq) = log.latest_state(doc).unwrap();
        assert_eq!(seq, 6);
        assert_eq!(state.as_counter().unwrap().value(), 6);
        assert_eq!(clock.get(&"a".into()), 6);
    }

    #[tokio::test]
    async fn test_stale_expected_sequence_loses_race() {
        let (_clock, _store, log) = log_with(4);
        let doc = DocumentId::new_v4();
        let head = log.head(doc).unwrap();
        let op = PendingOperation::new("a", VectorClock::new(), OpPayload::CounterAdd { delta: 1 });
        let outcome = log.engine().apply(&head.state, &head.clock, &op).unwrap();
        log.append(doc, &op, &outcome, 0).await.unwrap();
        let err = log.append(doc, &op, &outcome, 0).await.unwrap_err();
        assert_eq!(err, CommitError::RaceLost { expected: 0, actual: 1 });
        assert_eq!(log.stats().races_lost, 1);
    }

    #[tokio::test]
    async fn test_replay_streams_across_pages() {
        let (_clock, _store, log) = log_with(3);
        let doc = DocumentId::new_v4();
        for _ in 0..10 {
            add(&log, doc, "a", 1).await;
        }
        let seqs: Vec<u64> = log
            .replay(doc, 6)
            .unwrap()
            .map(|op| op.unwrap().sequence)
            .collect()
            .await;
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);

        let all = log.replay(doc, 0).unwrap().collect::<Vec<_>>().await;
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn test_replay_is_bounded_by_head_at_start() {
        let (_clock, _store, log) = log_with(2);
        let doc = DocumentId::new_v4();
        for _ in 0..3 {
            add(&log, doc, "a", 1).await;
        }
        let stream = log.replay(doc, 1).unwrap();
        add(&log, doc, "a", 1).await;
        assert_eq!(stream.collect::<Vec<_>>().await.len(), 3);
    }

    #[tokio::test]
    async fn test_locked_document_rejects_append() {
        let (_clock, _store, log) = log_with(4);
        let doc = DocumentId::new_v4();
        add(&log, doc, "a", 1).await;
        log.set_status(doc, DocumentStatus::Locked).await.unwrap();

        let head = log.head(doc).unwrap();
        let op = PendingOperation::new("a", head.clock.clone(), OpPayload::CounterAdd { delta: 1 });
        let outcome = log.engine().apply(&head.state, &head.clock, &op).unwrap();
        assert_eq!(
            log.append(doc, &op, &outcome, head.sequence).await.unwrap_err(),
            CommitError::Locked(doc)
        );
    }

    #[tokio::test]
    async fn test_find_dot_locates_introducing_operation() {
        let (_clock, _store, log) = log_with(2);
        let doc = DocumentId::new_v4();
        for author in ["a", "b", "a", "b", "b"] {
            add(&log, doc, author, 1).await;
        }
        let dot = |author: &str, counter| Dot { author: author.into(), counter };

        assert_eq!(log.find_dot(doc, &dot("a", 2)).unwrap().unwrap().sequence, 3);
        assert_eq!(log.find_dot(doc, &dot("b", 1)).unwrap().unwrap().sequence, 2);
        assert_eq!(log.find_dot(doc, &dot("b", 3)).unwrap().unwrap().sequence, 5);
        assert!(log.find_dot(doc, &dot("a", 3)).unwrap().is_none());
        assert!(log.find_dot(doc, &dot("c", 1)).unwrap().is_none());
        assert!(log.find_dot(DocumentId::new_v4(), &dot("a", 1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_dot_misses_pruned_operations() {
        let (clock, _store, log) = log_with(4);
        let doc = DocumentId::new_v4();
        add(&log, doc, "a", 1).await;
        clock.advance(Duration::days(40));
        let now = clock.now();
        log.prune(doc, now - Duration::days(30), now - Duration::days(7))
            .await
            .unwrap();
        let dot = Dot { author: "a".into(), counter: 1 };
        assert!(log.find_dot(doc, &dot).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_locks_are_removed() {
        let (_clock, _store, log) = log_with(4);
        let docs: Vec<_> = (0..3).map(|_| DocumentId::new_v4()).collect();
        for doc in &docs {
            add(&log, *doc, "a", 1).await;
        }
        assert_eq!(log.lock_count().await, 3);

        // A slot someone still holds survives.
        let held = log.document_lock(docs[0]).await;
        let _guard = held.lock().await;
        assert_eq!(log.remove_idle_locks().await, 2);
        assert_eq!(log.lock_count().await, 1);

        drop(_guard);
        drop(held);
        assert_eq!(log.remove_idle_locks().await, 1);
        assert_eq!(log.lock_count().await, 0);

        // Slots come back on demand.
        assert_eq!(add(&log, docs[1], "a", 1).await.sequence, 2);
    }

    #[tokio::test]
    async fn test_set_status_unknown_document() {
        let (_clock, _store, log) = log_with(4);
        let doc = DocumentId::new_v4();
        assert_eq!(
            log.set_status(doc, DocumentStatus::Active).await.unwrap_err(),
            SyncError::NotFound(doc)
        );
    }

    #[tokio::test]
    async fn test_prune_folds_prefix_into_checkpoint() {
        let (clock, store, log) = log_with(2);
        let doc = DocumentId::new_v4();
        for _ in 0..5 {
            add(&log, doc, "a", 2).await;
        }
        clock.advance(Duration::days(40));
        for _ in 0..2 {
            add(&log, doc, "b", 1).await;
        }
        clock.advance(Duration::days(10));

        let now = clock.now();
        let outcome = log
            .prune(doc, now - Duration::days(30), now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PruneOutcome::Pruned {
                removed: 5,
                checkpoint_sequence: 5
            }
        );
        assert_eq!(store.operation_count(), 2);

        let checkpoint = log.checkpoint(doc).unwrap().unwrap();
        assert_eq!(checkpoint.state.as_counter().unwrap().value(), 10);
        assert!(matches!(
            log.replay(doc, 3),
            Err(SyncError::Pruned { requested: 3, first_available: 6 })
        ));

        // Checkpoint plus the remaining log reconstructs the head.
        let rest: Vec<OperationRecord> = log
            .replay(doc, checkpoint.first_available())
            .unwrap()
            .map(|op| op.unwrap())
            .collect()
            .await;
        let (state, vclock) = log
            .engine()
            .replay(checkpoint.state, checkpoint.clock, rest.iter().map(OperationRecord::logged))
            .unwrap();
        let (head_state, head_clock, _) = log.latest_state(doc).unwrap();
        assert_eq!(state, head_state);
        assert_eq!(vclock, head_clock);

        // Idempotent.
        assert_eq!(
            log.prune(doc, now - Duration::days(30), now - Duration::days(7))
                .await
                .unwrap(),
            PruneOutcome::NothingToPrune
        );
    }

    #[tokio::test]
    async fn test_prune_skips_recently_active_document() {
        let (clock, store, log) = log_with(4);
        let doc = DocumentId::new_v4();
        add(&log, doc, "a", 1).await;
        clock.advance(Duration::days(40));
        add(&log, doc, "a", 1).await;

        let now = clock.now();
        assert_eq!(
            log.prune(doc, now - Duration::days(30), now - Duration::days(7))
                .await
                .unwrap(),
            PruneOutcome::RecentlyActive
        );
        assert_eq!(store.operation_count(), 2);
    }
}
