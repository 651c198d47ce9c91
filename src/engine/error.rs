//! Engine error types
//!
//! Taxonomy: transport failures are fatal and terminate the run; every
//! other variant is contained — a failed negotiation returns its selection
//! to idle, a failed payload operation abandons the current transfer.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the selection engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Display connection lost or request-level wire failure escalated.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A conversion flow was abandoned; the selection is back at idle.
    #[error("negotiation failed for '{selection}': {detail}")]
    Negotiation {
        /// Selection name
        selection: String,
        /// What went wrong
        detail: String,
    },

    /// No free transfer property slot.
    #[error("property slot pool exhausted ({capacity} slots all in use)")]
    SlotsExhausted {
        /// Pool capacity
        capacity: usize,
    },

    /// Local payload source/sink failed; the transfer is abandoned.
    #[error("payload store: {0}")]
    Payload(#[from] std::io::Error),

    /// Engine configuration is unusable.
    #[error("invalid engine option: {0}")]
    InvalidOption(String),
}

impl EngineError {
    /// Whether this error must terminate the run.
    ///
    /// Only a broken connection is fatal; request-level rejections and all
    /// local failures are recovered by the handlers that raise them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Transport(e) if e.is_fatal())
    }
}

/// Engine result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
