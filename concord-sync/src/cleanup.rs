//! Retention and cleanup.
//!
//! Each pass is idempotent: it ends presence sessions past the timeout,
//! forgets long-ended sessions, folds old operations of idle documents into
//! checkpoints, and drops expired rate-limit windows, unused topics, and
//! per-document write slots nobody holds.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::engine::SyncEngine;
use crate::oplog::PruneOutcome;

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions_expired: usize,
    pub sessions_purged: usize,
    pub documents_scanned: usize,
    pub documents_pruned: usize,
    pub operations_pruned: u64,
    pub rate_windows_pruned: usize,
    pub topics_removed: usize,
    pub locks_removed: usize,
    /// Documents whose pruning failed; retried on the next pass.
    pub errors: usize,
}

pub struct CleanupWorker {
    engine: Arc<SyncEngine>,
}

impl CleanupWorker {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub async fn run_once(&self) -> CleanupReport {
        let engine = &self.engine;
        let config = engine.config();
        let mut report = CleanupReport {
            sessions_expired: engine.expire_presence().await.len(),
            sessions_purged: engine
                .presence()
                .purge_ended(config.presence.ended_retention())
                .await,
            ..CleanupReport::default()
        };

        let now = engine.clock().now();
        let cutoff = now - config.retention.retention();
        let idle_since = now - config.retention.recent_activity();
        match engine.log().documents() {
            Ok(documents) => {
                report.documents_scanned = documents.len();
                for id in documents {
                    match engine.log().prune(id, cutoff, idle_since).await {
                        Ok(PruneOutcome::Pruned { removed, .. }) => {
                            report.documents_pruned += 1;
                            report.operations_pruned += removed;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            report.errors += 1;
                            log::error!("Pruning {id} failed: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                log::error!("Listing documents for pruning failed: {e}");
            }
        }

        report.rate_windows_pruned = engine.limiter().prune().await;
        report.topics_removed = engine.broadcaster().remove_idle().await;
        report.locks_removed = engine.log().remove_idle_locks().await;

        if report != CleanupReport::default() {
            log::info!("Cleanup pass: {report:?}");
        }
        report
    }

    /// Run a pass every `interval` until the handle is shut down.
    pub fn spawn(self, interval: Duration) -> CleanupHandle {
        let (shutdown_tx, mut shutdown) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.run_once().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("Cleanup worker stopped");
        });
        CleanupHandle { shutdown_tx, task }
    }
}

/// Stops a spawned [`CleanupWorker`].
pub struct CleanupHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signal the worker and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            log::error!("Cleanup worker panicked: {e}");
        }
    }
}
