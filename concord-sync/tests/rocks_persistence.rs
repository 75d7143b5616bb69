//! Persistence integration tests.
//!
//! Verifies:
//! - Committed operations and document heads survive a restart
//! - Sequence numbering continues where it stopped
//! - Checkpoints and pruned ranges survive a restart
//! - Workflow status is persisted

use concord_core::{DocumentId, MergeRegistry, OpPayload, VectorClock};
use concord_sync::{
    CleanupWorker, DocumentStatus, EngineConfig, LogStore, ManualClock, RocksStore, StoreConfig,
    SyncEngine, SyncError,
};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn config_at(path: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.path = Some(path.to_path_buf());
    config.storage.sync_writes = false;
    config.rate_limit.limit = 1_000;
    config
}

fn set(key: &str, value: &str) -> OpPayload {
    OpPayload::MapSet {
        key: key.into(),
        value: value.into(),
    }
}

#[tokio::test]
async fn test_operations_survive_restart() {
    let dir = tempdir().unwrap();
    let doc = DocumentId::new_v4();

    let before = {
        let engine = SyncEngine::open(config_at(dir.path())).unwrap();
        let mut observed = VectorClock::new();
        for (key, value) in [("title", "\"Q3\""), ("owner", "\"dana\""), ("title", "\"Q4\"")] {
            observed = engine
                .submit_operation(doc, "dana", observed, set(key, value))
                .await
                .unwrap()
                .clock;
        }
        engine.latest_state(doc).unwrap()
    };

    let engine = SyncEngine::open(config_at(dir.path())).unwrap();
    assert_eq!(engine.stats().await.backend, "rocksdb");
    let after = engine.latest_state(doc).unwrap();
    assert_eq!(after, before);
    let map = after.0.as_map().unwrap();
    assert_eq!(map.get("title"), Some("\"Q4\""));

    let ops: Vec<_> = engine
        .replay(doc, 1)
        .unwrap()
        .map(|op| op.unwrap())
        .collect()
        .await;
    assert_eq!(ops.len(), 3);
    assert_eq!(ops[2].payload, set("title", "\"Q4\""));

    let next = engine
        .submit_operation(doc, "dana", after.1, set("status", "\"done\""))
        .await
        .unwrap();
    assert_eq!(next.sequence, 4);
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = tempdir().unwrap();
    let engine = SyncEngine::open(config_at(dir.path())).unwrap();
    let docs: Vec<_> = (0..3).map(|_| DocumentId::new_v4()).collect();

    for (i, doc) in docs.iter().enumerate() {
        let mut observed = VectorClock::new();
        for _ in 0..=i {
            observed = engine
                .submit_operation(*doc, "eve", observed, OpPayload::CounterAdd { delta: 2 })
                .await
                .unwrap()
                .clock;
        }
    }
    drop(engine);

    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let mut listed = store.list_documents().unwrap();
    listed.sort();
    let mut expected = docs.clone();
    expected.sort();
    assert_eq!(listed, expected);

    for (i, doc) in docs.iter().enumerate() {
        let head = store.load_document(*doc).unwrap().unwrap();
        assert_eq!(head.sequence, i as u64 + 1);
        assert_eq!(head.state.as_counter().map(|c| c.value()), Some(2 * (i as i64 + 1)));
    }
}

#[tokio::test]
async fn test_checkpoint_and_status_survive_restart() {
    let dir = tempdir().unwrap();
    let doc = DocumentId::new_v4();
    let clock = Arc::new(ManualClock::starting_now());

    let head = {
        let store_config = config_at(dir.path()).storage.store_config().unwrap();
        let store = Arc::new(RocksStore::open(store_config).unwrap());
        let engine = Arc::new(SyncEngine::new(
            config_at(dir.path()),
            store,
            MergeRegistry::with_defaults(),
            clock.clone(),
        ));
        let mut observed = VectorClock::new();
        for delta in [5, -1, 3] {
            observed = engine
                .submit_operation(doc, "finn", observed, OpPayload::CounterAdd { delta })
                .await
                .unwrap()
                .clock;
        }
        clock.advance(chrono::Duration::days(45));
        let report = CleanupWorker::new(engine.clone()).run_once().await;
        assert_eq!(report.operations_pruned, 3);
        engine.set_status(doc, DocumentStatus::Locked).await.unwrap()
    };

    let engine = SyncEngine::open(config_at(dir.path())).unwrap();
    let checkpoint = engine.checkpoint(doc).unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 3);
    assert_eq!(checkpoint.state, head.state);
    assert_eq!(engine.document(doc).unwrap().status, DocumentStatus::Locked);

    assert!(matches!(engine.replay(doc, 1).err(), Some(SyncError::Pruned { .. })));
    let err = engine
        .submit_operation(doc, "finn", head.clock, OpPayload::CounterAdd { delta: 1 })
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::Locked(doc));
}
