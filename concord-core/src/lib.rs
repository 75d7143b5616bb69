//! # concord-core
//!
//! Data types and algorithms for collaborative document sync. Everything
//! here is pure and synchronous; persistence, fan-out and transport live in
//! `concord-sync`.
//!
//! ## Architecture
//!
//! ```text
//!  PendingOperation { author, observed clock, payload }
//!          │
//!          ▼
//!  ┌─────────────────┐   compare / merge / increment
//!  │  VectorClock    │◄──────────────────────────────┐
//!  └─────────────────┘                               │
//!          │                                         │
//!          ▼                                         │
//!  ┌─────────────────┐   kind → MergeFunction   ┌────┴──────────┐
//!  │  MergeEngine    │─────────────────────────►│ MergeRegistry │
//!  │  validate       │                          │  Text  (yrs)  │
//!  │  classify       │                          │  Map   (LWW)  │
//!  │  apply / replay │                          │  Counter (PN) │
//!  └─────────────────┘                          │  Custom(..)   │
//!          │                                    └───────────────┘
//!          ▼
//!  MergeOutcome { state, clock, stamped, disposition }
//! ```
//!
//! ## Guarantees
//!
//! | Property      | Holds for                                          |
//! |---------------|----------------------------------------------------|
//! | Commutative   | `merge(A, B) == merge(B, A)` on clocks             |
//! | Idempotent    | re-applying an operation (same dot) is a no-op     |
//! | Convergent    | concurrent ops folded in either order, same state  |
//! | Replayable    | folding the log from empty rebuilds state + clock  |

pub mod author;
pub mod clock;
pub mod engine;
pub mod error;
pub mod merge;
pub mod payload;

/// Documents are identified by UUID.
pub type DocumentId = uuid::Uuid;

pub use author::{AuthorId, AuthorNamespace};
pub use clock::{ClockOrdering, VectorClock};
pub use engine::{Disposition, LoggedOp, MergeEngine, MergeOutcome, PendingOperation};
pub use error::ValidationError;
pub use merge::{
    CounterMerge, CustomMerge, Dot, LwwMap, LwwMapMerge, MergeFunction, MergeRegistry, OpContext,
    PnCounter, Stamp, TextMerge, TextState,
};
pub use payload::{DocumentKind, DocumentState, OpPayload};
