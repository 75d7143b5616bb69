//! The sync engine: one entry point per external call.
//!
//! ```text
//! submit_operation ──► RateLimiter ──► MergeEngine (speculative, on a head snapshot)
//!                                          │
//!                                          ▼
//!                         OperationLog::append (per-document slot)
//!                           │ RaceLost / Storage: recompute, retry
//!                           ▼
//!                  Broadcaster ── document:<id>:operations
//!
//! heartbeat / leave ──► PresenceTracker ──► Broadcaster ── document:<id>:presence
//! ```

use futures_util::future;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use concord_core::{
    AuthorId, Disposition, DocumentId, DocumentState, MergeEngine, MergeRegistry, OpPayload,
    PendingOperation, VectorClock,
};

use crate::broadcast::{BroadcastStats, Broadcaster, Event, Subscription};
use crate::config::EngineConfig;
use crate::error::{CommitError, StoreError, SyncError};
use crate::oplog::{LogStats, OperationLog};
use crate::presence::{PresenceChange, PresenceEvent, PresenceSession, PresenceTracker};
use crate::ratelimit::RateLimiter;
use crate::storage::{Checkpoint, DocumentRecord, DocumentStatus, LogStore, MemoryStore, OperationRecord, RocksStore};
use crate::time::{Clock, SystemClock};
use crate::topic::{write_limit_key, Topic};

/// Reply to [`SyncEngine::submit_operation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub sequence: u64,
    pub conflict: bool,
    /// Document clock after the commit. Submitting the next operation with
    /// this clock never trips the clock-ahead check.
    pub clock: VectorClock,
}

/// Reply to [`SyncEngine::heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub active_count: usize,
    pub change: PresenceChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub backend: &'static str,
    pub submitted: u64,
    pub committed: u64,
    pub conflicts: u64,
    pub rate_limited: u64,
    pub rejected: u64,
    pub transient_failures: u64,
    pub log: LogStats,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    committed: AtomicU64,
    conflicts: AtomicU64,
    rate_limited: AtomicU64,
    rejected: AtomicU64,
    transient_failures: AtomicU64,
}

pub struct SyncEngine {
    config: EngineConfig,
    log: Arc<OperationLog>,
    presence: PresenceTracker,
    broadcaster: Broadcaster,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn LogStore>,
        registry: MergeRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let merge = Arc::new(MergeEngine::new(registry, config.authors.clone()));
        let log = Arc::new(OperationLog::new(
            store,
            merge,
            clock.clone(),
            config.commit.replay_page_size,
        ));
        Self {
            presence: PresenceTracker::new(config.presence.timeout(), clock.clone()),
            broadcaster: Broadcaster::new(config.broadcast.capacity),
            limiter: RateLimiter::new(clock.clone()),
            log,
            clock,
            config,
            counters: Counters::default(),
        }
    }

    /// Default merge functions, in-memory store, system clock.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            MergeRegistry::with_defaults(),
            Arc::new(SystemClock),
        )
    }

    /// Open the store named by `config.storage` (RocksDB when a path is set,
    /// memory otherwise).
    pub fn open(config: EngineConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn LogStore> = match config.storage.store_config() {
            Some(store_config) => Arc::new(RocksStore::open(store_config)?),
            None => {
                log::warn!("No storage path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        let documents = store.list_documents()?.len();
        log::info!("Opened {} store with {documents} documents", store.backend());
        Ok(Self::new(
            config,
            store,
            MergeRegistry::with_defaults(),
            Arc::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Rate-limit, merge, commit, publish.
    ///
    /// Lost commit races and storage failures are retried against the new
    /// head up to `commit.max_retries` times, then reported as
    /// [`SyncError::Transient`]. Resubmitting the same operation after a
    /// transient failure is safe: if it did commit, the original commit is
    /// returned and nothing is appended. A different operation reusing an
    /// already committed dot is rejected with
    /// [`ValidationError::DuplicateDot`](concord_core::ValidationError::DuplicateDot).
    pub async fn submit_operation(
        &self,
        document: DocumentId,
        author: impl Into<AuthorId>,
        observed: VectorClock,
        payload: OpPayload,
    ) -> Result<SubmitResult, SyncError> {
        let op = PendingOperation::new(author, observed, payload);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let limits = &self.config.rate_limit;
        let admission = self
            .limiter
            .admit(&write_limit_key(document, &op.author), limits.limit, limits.window_secs)
            .await;
        if !admission.allowed {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::RateLimited {
                remaining: admission.remaining,
                reset_secs: admission.reset_secs,
            });
        }

        self.log.engine().validate(&op).map_err(|e| self.rejected(document, &op, e))?;

        let max_retries = self.config.commit.max_retries;
        let mut attempt = 0;
        loop {
            let head = self.log.head(document)?;
            if head.status == DocumentStatus::Locked {
                return Err(SyncError::Locked(document));
            }
            let outcome = self
                .log
                .engine()
                .apply(&head.state, &head.clock, &op)
                .map_err(|e| self.rejected(document, &op, e))?;
            if outcome.disposition == Disposition::Redundant {
                return self.acknowledge_retry(document, &op, head.clock);
            }

            match self.log.append(document, &op, &outcome, head.sequence).await {
                Ok(record) => {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                    if record.conflict {
                        self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                        log::info!(
                            "Concurrent {} by {} on {document} committed as #{}",
                            record.operation_type,
                            record.author,
                            record.sequence
                        );
                    }
                    let result = SubmitResult {
                        sequence: record.sequence,
                        conflict: record.conflict,
                        clock: outcome.clock,
                    };
                    self.broadcaster
                        .publish(Topic::Operations(document), Event::Operation(record))
                        .await;
                    return Ok(result);
                }
                Err(CommitError::Locked(id)) => return Err(SyncError::Locked(id)),
                Err(e) if attempt >= max_retries => {
                    self.counters.transient_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Giving up on {} by {} on {document} after {} attempts: {e}",
                        op.payload.operation_type(),
                        op.author,
                        attempt + 1
                    );
                    return Err(SyncError::Transient(e.to_string()));
                }
                Err(e) => {
                    attempt += 1;
                    log::warn!("Commit attempt {attempt} on {document} failed ({e}); retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// A redundant operation is only accepted as a resubmission of the one
    /// already logged at its dot, and is answered with that commit.
    fn acknowledge_retry(
        &self,
        document: DocumentId,
        op: &PendingOperation,
        clock: VectorClock,
    ) -> Result<SubmitResult, SyncError> {
        let original = self.log.find_dot(document, &op.dot())?;
        self.log
            .engine()
            .check_retry(op, original.as_ref().map(OperationRecord::logged))
            .map_err(|e| self.rejected(document, op, e))?;
        let Some(original) = original else {
            return Err(SyncError::NotFound(document));
        };
        log::debug!(
            "Resubmitted {} by {} on {document} matches #{}",
            original.operation_type,
            original.author,
            original.sequence
        );
        Ok(SubmitResult {
            sequence: original.sequence,
            conflict: original.conflict,
            clock,
        })
    }

    fn rejected(
        &self,
        document: DocumentId,
        op: &PendingOperation,
        error: concord_core::ValidationError,
    ) -> SyncError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!("Rejected {} by {} on {document}: {error}", op.payload.operation_type(), op.author);
        SyncError::Validation(error)
    }

    /// Record a heartbeat and announce it on the presence topic.
    pub async fn heartbeat(
        &self,
        document: DocumentId,
        author: impl Into<AuthorId>,
        payload: Vec<u8>,
    ) -> Result<HeartbeatAck, SyncError> {
        let author = author.into();
        self.log.engine().namespace().validate(&author)?;
        let outcome = self.presence.heartbeat(document, &author, payload).await;
        let event = PresenceEvent {
            document_id: document,
            author,
            change: outcome.change,
            payload: outcome.session.payload,
            at: outcome.session.last_heartbeat,
            active_count: outcome.active_count,
        };
        self.broadcaster
            .publish(Topic::Presence(document), Event::Presence(event))
            .await;
        Ok(HeartbeatAck {
            active_count: outcome.active_count,
            change: outcome.change,
        })
    }

    /// End the author's session, if any, and announce it.
    pub async fn leave(&self, document: DocumentId, author: &AuthorId) -> Option<PresenceSession> {
        let session = self.presence.leave(document, author).await?;
        self.announce_end(&session, PresenceChange::Left).await;
        Some(session)
    }

    /// Sweep expired sessions and announce each one.
    pub async fn expire_presence(&self) -> Vec<PresenceSession> {
        let ended = self.presence.sweep_expired().await;
        for session in &ended {
            self.announce_end(session, PresenceChange::Expired).await;
        }
        ended
    }

    async fn announce_end(&self, session: &PresenceSession, change: PresenceChange) {
        let document = session.document_id;
        let event = PresenceEvent {
            document_id: document,
            author: session.author.clone(),
            change,
            payload: Vec::new(),
            at: session.ended_at.unwrap_or_else(|| self.clock.now()),
            active_count: self.presence.active_count(document).await,
        };
        self.broadcaster
            .publish(Topic::Presence(document), Event::Presence(event))
            .await;
    }

    pub async fn active_sessions(&self, document: DocumentId) -> Vec<PresenceSession> {
        self.presence.active_sessions(document).await
    }

    /// Committed operations from `from` up to the current head.
    pub fn replay(
        &self,
        document: DocumentId,
        from: u64,
    ) -> Result<impl Stream<Item = Result<OperationRecord, SyncError>> + Send + 'static, SyncError>
    {
        self.log.replay(document, from)
    }

    /// Replay from `from`, then continue with live commits, without gaps or
    /// duplicates between the two. If the live side lags past a commit the
    /// stream ends; resume again from the sequence after the last item.
    pub async fn resume(
        &self,
        document: DocumentId,
        from: u64,
    ) -> Result<impl Stream<Item = Result<OperationRecord, SyncError>> + Send + 'static, SyncError>
    {
        // Subscribe before reading history so nothing committed in between
        // is missed.
        let live = self.subscribe_operations(document).await;
        let history = self.log.replay(document, from)?;

        let live_ops = live.into_stream().filter_map(|event| {
            future::ready(match &*event {
                Event::Operation(op) => Some(Ok(op.clone())),
                Event::Presence(_) => None,
            })
        });

        Ok(history
            .chain(live_ops)
            .scan(from.max(1), |next, item| {
                let out = match item {
                    Ok(op) if op.sequence < *next => Some(None),
                    Ok(op) if op.sequence > *next => {
                        log::warn!(
                            "Live stream on {} skipped from #{} to #{}; resume required",
                            op.document_id,
                            *next,
                            op.sequence
                        );
                        None
                    }
                    Ok(op) => {
                        *next = op.sequence + 1;
                        Some(Some(Ok(op)))
                    }
                    Err(e) => Some(Some(Err(e))),
                };
                future::ready(out)
            })
            .filter_map(future::ready))
    }

    pub async fn subscribe_operations(&self, document: DocumentId) -> Subscription {
        self.broadcaster.subscribe(Topic::Operations(document)).await
    }

    pub async fn subscribe_presence(&self, document: DocumentId) -> Subscription {
        self.broadcaster.subscribe(Topic::Presence(document)).await
    }

    pub fn latest_state(
        &self,
        document: DocumentId,
    ) -> Result<(DocumentState, VectorClock, u64), SyncError> {
        Ok(self.log.latest_state(document)?)
    }

    pub fn document(&self, document: DocumentId) -> Result<DocumentRecord, SyncError> {
        Ok(self.log.head(document)?)
    }

    pub fn checkpoint(&self, document: DocumentId) -> Result<Option<Checkpoint>, SyncError> {
        Ok(self.log.checkpoint(document)?)
    }

    pub async fn set_status(
        &self,
        document: DocumentId,
        status: DocumentStatus,
    ) -> Result<DocumentRecord, SyncError> {
        self.log.set_status(document, status).await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            backend: self.log.store().backend(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            transient_failures: self.counters.transient_failures.load(Ordering::Relaxed),
            log: self.log.stats(),
            broadcast: self.broadcaster.stats().await,
        }
    }
}
