//! # xseld
//!
//! Selection transfer engine for X11-style display servers.
//!
//! Tracks a configured set of selections, negotiates ownership with peer
//! clients, walks their advertised target lists, and moves payloads of
//! arbitrary size through the display server's property mechanism using
//! fixed-size chunked transfers.
//!
//! # Architecture
//!
//! ```text
//! xseld
//!   ├─> Transport (display-server connection: atoms, windows, properties)
//!   ├─> Atom Registry (name ↔ atom cache)
//!   ├─> Selection Engine (ownership, negotiation, transfer state machines)
//!   │     ├─> Property slot pool (transfer staging properties)
//!   │     ├─> Incoming transfers (chunk reassembly → payload store)
//!   │     └─> Outgoing transfers (payload store → chunk stream)
//!   └─> Event Loop (dispatch + signal cancellation)
//! ```
//!
//! # Data Flow
//!
//! **Fetch Path:** owner change → TARGETS query → per-target conversions →
//! one-shot or chunked reads → payload store
//!
//! **Serve Path:** peer request → TARGETS/TIMESTAMP/data reply →
//! one-shot write or chunked writes paced by the requestor's deletes

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Atom name resolution and caching
pub mod atoms;

/// Configuration loading and validation
pub mod config;

/// Selection negotiation and transfer engine
pub mod engine;

/// Event dispatch loop and cancellation
pub mod runtime;

/// Logging setup and transfer counters
pub mod telemetry;

/// Display-server transport abstraction
pub mod transport;
