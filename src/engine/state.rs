//! Per-Selection Negotiation State
//!
//! One [`SelectionRecord`] per tracked selection. The record serializes
//! conversions target-by-target: a TARGETS reply fills `pending_targets`,
//! and exactly one [`PendingConversion`] may be outstanding at a time.

use std::collections::VecDeque;

use crate::transport::{Atom, Window};

/// Negotiation phase of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Nothing in flight.
    Idle,
    /// We own the selection.
    OwnerClaimed,
    /// TARGETS conversion issued, reply pending.
    AwaitingTargets,
    /// A data conversion issued, reply or INCR stream pending.
    AwaitingTargetData,
    /// Ownership loss reported; re-query in progress.
    Cleared,
}

impl NegotiationPhase {
    /// Short label for transition logging.
    pub fn label(self) -> &'static str {
        match self {
            NegotiationPhase::Idle => "Idle",
            NegotiationPhase::OwnerClaimed => "OwnerClaimed",
            NegotiationPhase::AwaitingTargets => "AwaitingTargets",
            NegotiationPhase::AwaitingTargetData => "AwaitingTargetData",
            NegotiationPhase::Cleared => "Cleared",
        }
    }
}

/// The single conversion currently awaited for a selection.
///
/// Matched by target, not by property: property slots are drawn from a
/// small reused pool, while the pending target uniquely identifies the
/// request during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConversion {
    /// Target representation requested
    pub target: Atom,
    /// Slot the reply will land in
    pub property: Atom,
}

/// Ownership and negotiation state of one named selection.
#[derive(Debug)]
pub struct SelectionRecord {
    /// Interned selection name
    pub selection: Atom,
    /// Human-readable name for logging
    pub name: String,
    /// Window currently asserted as owner, if any
    pub owner: Option<Window>,
    /// Current phase
    pub phase: NegotiationPhase,
    /// Representations still to be requested, in delivered order
    pub pending_targets: VecDeque<Atom>,
    /// The one conversion in flight, if any
    pub pending: Option<PendingConversion>,
}

impl SelectionRecord {
    /// Fresh idle record.
    pub fn new(selection: Atom, name: String) -> Self {
        Self {
            selection,
            name,
            owner: None,
            phase: NegotiationPhase::Idle,
            pending_targets: VecDeque::new(),
            pending: None,
        }
    }

    /// Whether `window` is the recorded owner.
    pub fn owned_by(&self, window: Window) -> bool {
        self.owner == Some(window)
    }

    /// Drop all negotiation state, keeping the name binding.
    ///
    /// Used when the owner disappears or a negotiation is abandoned.
    /// Returns the slot of the conversion that was in flight, if any, so
    /// the caller can put it back in the pool.
    pub fn reset(&mut self) -> Option<Atom> {
        self.owner = None;
        self.phase = NegotiationPhase::Idle;
        self.pending_targets.clear();
        self.pending.take().map(|p| p.property)
    }
}
