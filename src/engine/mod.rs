//! Selection Transfer Engine
//!
//! The protocol core: per-selection negotiation state, the transfer state
//! machine, the INCR chunk pump, the transfer property slot pool, and the
//! payload source/sink adapter.
//!
//! # Architecture
//!
//! ```text
//! DisplayEvent ─> SelectionEngine ─┬─> SelectionRecord (per selection)
//!                                  ├─> IncomingTransfer (≤1, local-as-sink)
//!                                  ├─> OutgoingTransfer (≤1, local-as-source)
//!                                  ├─> PropertySlotPool (CUT_BUFFER ring)
//!                                  └─> PayloadStore (pluggable storage)
//! ```
//!
//! All engine state is owned by a single task; the event loop in
//! [`crate::runtime`] feeds it one event at a time, which preserves the
//! at-most-one-pending-conversion invariant without locking.

pub mod error;
pub mod incr;
pub mod machine;
pub mod payload;
pub mod property;
pub mod slots;
pub mod state;

pub use error::{EngineError, Result};
pub use incr::{IncomingTransfer, OutgoingTransfer, DEFAULT_CHUNK_SIZE};
pub use machine::{EngineOptions, SelectionEngine};
pub use payload::{FileStore, MemoryStore, PayloadSink, PayloadSource, PayloadStore};
pub use property::PropertyChannel;
pub use slots::PropertySlotPool;
pub use state::{NegotiationPhase, PendingConversion, SelectionRecord};
