//! # concord-sync: Concurrent sync service for collaborative documents
//!
//! Sequences, persists, and distributes operations merged by
//! `concord-core`, tracks presence, and serves it all over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   bincode frames    │             │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ SyncEngine  │
//!                                     └──────┬──────┘
//!        ┌──────────────┬───────────────┬────┴─────────┬──────────────┐
//!        ▼              ▼               ▼              ▼              ▼
//!  RateLimiter   OperationLog    PresenceTracker  Broadcaster   CleanupWorker
//!                      │
//!                 dyn LogStore (MemoryStore | RocksStore)
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: `submit_operation`, `heartbeat`, `replay` and friends
//! - [`oplog`]: per-document serialized append, paginated replay, pruning
//! - [`storage`]: `LogStore` trait, in-memory and RocksDB backends
//! - [`presence`]: heartbeat sessions with timeout expiry
//! - [`broadcast`]: topic fan-out to live subscribers
//! - [`ratelimit`]: fixed-window write limiter
//! - [`cleanup`]: periodic retention pass
//! - [`protocol`], [`server`], [`client`]: WebSocket transport
//! - [`config`]: typed TOML configuration
//!
//! ## Defaults
//!
//! | Setting | Default |
//! |---------|---------|
//! | Presence timeout | 5 min |
//! | Write limit per (document, author) | 10 / 60 s |
//! | Commit retries | 3 |
//! | Operation retention | 30 days |
//! | Recent-activity window (never pruned) | 7 days |

pub mod broadcast;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod ratelimit;
pub mod server;
pub mod storage;
pub mod time;
pub mod topic;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Broadcaster, Event, Subscription};
pub use cleanup::{CleanupHandle, CleanupReport, CleanupWorker};
pub use client::{ConnectionState, SyncClient};
pub use config::EngineConfig;
pub use engine::{EngineStats, HeartbeatAck, SubmitResult, SyncEngine};
pub use error::{CommitError, ConfigError, ErrorCode, ProtocolError, StoreError, SyncError};
pub use oplog::{LogStats, OperationLog, PruneOutcome};
pub use presence::{PresenceChange, PresenceEvent, PresenceSession, PresenceTracker};
pub use protocol::{ClientFrame, ClientMessage, ServerFrame, ServerMessage};
pub use ratelimit::{Admission, RateLimiter};
pub use server::{ServerStats, SyncServer};
pub use storage::{
    Checkpoint, DocumentRecord, DocumentStatus, LogStore, MemoryStore, OperationRecord,
    RocksStore, StoreConfig,
};
pub use time::{Clock, ManualClock, SystemClock};
pub use topic::Topic;
