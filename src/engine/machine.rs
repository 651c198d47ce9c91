//! Transfer State Machine
//!
//! Consumes protocol events and drives both transfer directions: as
//! requestor it walks the TARGETS list target-by-target and assembles
//! incoming payloads (one-shot or INCR); as owner it services selection
//! requests, answering TARGETS/TIMESTAMP/text inline and pumping large
//! payloads through an [`OutgoingTransfer`].
//!
//! Error containment follows the taxonomy in [`crate::engine::error`]:
//! request-level rejections abandon the affected negotiation or transfer
//! and the engine keeps running; only a broken connection propagates out.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::atoms::{AtomRegistry, WellKnownAtoms};
use crate::engine::error::{EngineError, Result};
use crate::engine::incr::{IncomingTransfer, OutgoingTransfer, DEFAULT_CHUNK_SIZE};
use crate::engine::payload::PayloadStore;
use crate::engine::property::PropertyChannel;
use crate::engine::slots::PropertySlotPool;
use crate::engine::state::{NegotiationPhase, PendingConversion, SelectionRecord};
use crate::telemetry::TransferStats;
use crate::transport::{
    Atom, DisplayEvent, DisplayTransport, PropertyState, PropertyValue, SelectionNotify, Window,
};

/// Longest text preview echoed to the log for received values.
const TEXT_PREVIEW_LEN: usize = 64;

/// Startup options for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Selection names to track (e.g. `PRIMARY`, `CLIPBOARD`)
    pub selections: Vec<String>,
    /// Chunk size for INCR transfers, fixed for the run
    pub chunk_size: usize,
    /// Representation served from the payload store when available
    pub native_target: String,
    /// Text served for STRING/UTF8_STRING requests
    pub text_payload: String,
    /// Claim ownership of every tracked selection at startup
    pub claim_on_start: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            selections: vec!["PRIMARY".to_string(), "CLIPBOARD".to_string()],
            chunk_size: DEFAULT_CHUNK_SIZE,
            native_target: "image/png".to_string(),
            text_payload: "Copy & Paste test".to_string(),
            claim_on_start: false,
        }
    }
}

/// The selection transfer state machine.
pub struct SelectionEngine<S: PayloadStore> {
    transport: Arc<dyn DisplayTransport>,
    registry: AtomRegistry,
    wk: WellKnownAtoms,
    channel: PropertyChannel,
    window: Window,
    selections: HashMap<Atom, SelectionRecord>,
    slots: PropertySlotPool,
    incoming: Option<IncomingTransfer>,
    outgoing: Option<OutgoingTransfer>,
    store: S,
    native_target: Atom,
    native_target_name: String,
    text_payload: Vec<u8>,
    chunk_size: usize,
    claim_on_start: bool,
    stats: TransferStats,
}

impl<S: PayloadStore> SelectionEngine<S> {
    /// Connect the engine: intern the protocol names, create the helper
    /// window, and register the tracked selections.
    pub async fn new(
        transport: Arc<dyn DisplayTransport>,
        store: S,
        options: EngineOptions,
    ) -> Result<Self> {
        if options.selections.is_empty() {
            return Err(EngineError::InvalidOption(
                "at least one selection must be tracked".into(),
            ));
        }
        if options.chunk_size == 0 {
            return Err(EngineError::InvalidOption("chunk_size must be nonzero".into()));
        }

        let registry = AtomRegistry::new(Arc::clone(&transport));
        registry.precache().await?;
        let wk = WellKnownAtoms::resolve(&registry).await?;
        let channel = PropertyChannel::new(Arc::clone(&transport), wk.incr);

        let window = transport.create_window().await?;
        // Property-change events on our own window carry incoming INCR chunks.
        transport.watch_properties(window, window).await?;

        let mut slot_atoms = Vec::with_capacity(8);
        for i in 0..8 {
            slot_atoms.push(registry.resolve(&format!("CUT_BUFFER{i}")).await?);
        }

        let native_target = registry.resolve(&options.native_target).await?;

        let mut selections = HashMap::new();
        for name in &options.selections {
            let atom = registry.resolve(name).await?;
            selections.insert(atom, SelectionRecord::new(atom, name.clone()));
        }

        info!(
            "selection engine ready on {} (window {window}, {} selections, {} byte chunks)",
            transport.name(),
            selections.len(),
            options.chunk_size
        );

        Ok(Self {
            transport,
            registry,
            wk,
            channel,
            window,
            selections,
            slots: PropertySlotPool::new(slot_atoms),
            incoming: None,
            outgoing: None,
            store,
            native_target,
            native_target_name: options.native_target,
            text_payload: options.text_payload.into_bytes(),
            chunk_size: options.chunk_size,
            claim_on_start: options.claim_on_start,
            stats: TransferStats::default(),
        })
    }

    /// The engine's helper window.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Negotiation record for a selection, if tracked.
    pub fn record(&self, selection: Atom) -> Option<&SelectionRecord> {
        self.selections.get(&selection)
    }

    /// Number of transfer property slots currently held.
    pub fn slots_held(&self) -> usize {
        self.slots.held()
    }

    /// Whether an incoming chunked transfer is live.
    pub fn incoming_active(&self) -> bool {
        self.incoming.is_some()
    }

    /// Whether an outgoing chunked transfer is live.
    pub fn outgoing_active(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Initial negotiation pass: learn (or claim) every tracked selection's
    /// owner, then ask each remote owner for its TARGETS list.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let tracked: Vec<Atom> = self.selections.keys().copied().collect();
        for selection in &tracked {
            if self.claim_on_start {
                self.claim(*selection).await?;
            } else {
                self.query_owner(*selection).await?;
            }
        }
        for selection in tracked {
            let remote_owner = self
                .selections
                .get(&selection)
                .map(|r| r.owner.is_some() && !r.owned_by(self.window))
                .unwrap_or(false);
            if remote_owner {
                self.request_targets(selection).await?;
            }
        }
        self.transport.flush().await?;
        Ok(())
    }

    /// Poll and process at most one event. Returns whether one was handled.
    pub async fn poll_once(&mut self) -> Result<bool> {
        match self.transport.poll_event(self.window) {
            Some(event) => {
                self.handle_event(event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Demultiplex one protocol event.
    pub async fn handle_event(&mut self, event: DisplayEvent) -> Result<()> {
        trace!("event: {event:?}");
        match event {
            DisplayEvent::OwnershipTrigger { selection } => {
                self.handle_ownership_trigger(selection).await
            }
            DisplayEvent::SelectionClear { owner, selection } => {
                self.handle_selection_clear(owner, selection).await
            }
            DisplayEvent::SelectionRequest {
                requestor,
                selection,
                target,
                property,
                ..
            } => {
                self.handle_selection_request(requestor, selection, target, property)
                    .await
            }
            DisplayEvent::SelectionNotify {
                requestor,
                selection,
                target,
                property,
            } => {
                self.handle_selection_notify(requestor, selection, target, property)
                    .await
            }
            DisplayEvent::PropertyNotify {
                window,
                property,
                state,
            } => self.handle_property_notify(window, property, state).await,
        }
    }

    /// Close handles and report final counters. Partial transfers are
    /// abandoned, not completed.
    pub async fn shutdown(mut self) -> TransferStats {
        if let Some(mut incoming) = self.incoming.take() {
            warn!(
                "abandoning incoming transfer at {} bytes on shutdown",
                incoming.received
            );
            if let Some(sink) = incoming.sink.take() {
                if let Err(e) = sink.close() {
                    warn!("sink close failed during teardown: {e}");
                }
            }
        }
        if let Some(outgoing) = self.outgoing.take() {
            warn!(
                "abandoning outgoing transfer at {} bytes on shutdown",
                outgoing.sent
            );
        }
        if let Err(e) = self.transport.destroy_window(self.window).await {
            debug!("window teardown: {e}");
        }
        self.stats.log_summary();
        self.stats
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    /// Local gesture: learn the current owner and claim the selection if it
    /// is not already ours.
    async fn handle_ownership_trigger(&mut self, selection: Atom) -> Result<()> {
        if !self.selections.contains_key(&selection) {
            return Ok(());
        }
        let name = self.selection_name(selection);
        info!("ownership trigger for '{name}'");
        self.query_owner(selection).await?;
        let already_ours = self
            .selections
            .get(&selection)
            .map(|r| r.owned_by(self.window))
            .unwrap_or(false);
        if !already_ours {
            self.claim(selection).await?;
        }
        Ok(())
    }

    /// Issue a become-owner request. Rejection is recoverable: the record
    /// keeps its prior state.
    async fn claim(&mut self, selection: Atom) -> Result<()> {
        let name = self.selection_name(selection);
        match self
            .transport
            .set_selection_owner(self.window, selection)
            .await
        {
            Ok(()) => {
                if let Some(record) = self.selections.get_mut(&selection) {
                    record.owner = Some(self.window);
                    set_phase(record, NegotiationPhase::OwnerClaimed);
                }
                info!("claimed ownership of '{name}' as {}", self.window);
                self.transport.flush().await?;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("ownership claim for '{name}' rejected: {e}");
                Ok(())
            }
        }
    }

    /// Who-owns query. No owner clears the record; an owner updates only
    /// the owner field, so repeated queries are idempotent.
    async fn query_owner(&mut self, selection: Atom) -> Result<Option<Window>> {
        let name = self.selection_name(selection);
        let owner = self.transport.selection_owner(selection).await?;
        match owner {
            None => {
                debug!("'{name}' has no owner");
                if let Some(record) = self.selections.get_mut(&selection) {
                    if let Some(slot) = record.reset() {
                        self.slots.release(slot);
                    }
                }
            }
            Some(window) => {
                debug!("'{name}' owned by {window}");
                if let Some(record) = self.selections.get_mut(&selection) {
                    record.owner = Some(window);
                }
            }
        }
        Ok(owner)
    }

    /// Ownership loss: re-query, and if someone else took the selection,
    /// re-enter the TARGETS flow exactly once — the data may now be
    /// available from whoever took it.
    async fn handle_selection_clear(&mut self, owner: Window, selection: Atom) -> Result<()> {
        if owner != self.window {
            return Ok(());
        }
        let name = self.selection_name(selection);
        info!("lost ownership of '{name}'");
        if let Some(record) = self.selections.get_mut(&selection) {
            record.owner = None;
            set_phase(record, NegotiationPhase::Cleared);
        }
        let new_owner = self.query_owner(selection).await?;
        match new_owner {
            Some(window) if window != self.window => self.request_targets(selection).await,
            _ => {
                if let Some(record) = self.selections.get_mut(&selection) {
                    set_phase(record, NegotiationPhase::Idle);
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Local-as-sink: TARGETS walk and conversions
    // ------------------------------------------------------------------

    /// Ask the remote owner for its capability list.
    async fn request_targets(&mut self, selection: Atom) -> Result<()> {
        let Some(record) = self.selections.get_mut(&selection) else {
            return Ok(());
        };
        if record.pending.is_some() {
            // One conversion per selection at a time; the reply handler
            // continues the walk.
            return Ok(());
        }
        record.pending_targets.clear();
        self.issue_conversion(selection, self.wk.targets, NegotiationPhase::AwaitingTargets)
            .await
    }

    /// Pop and request the next queued target, or settle back to idle.
    ///
    /// Data conversions are serialized process-wide: while one is awaited
    /// on any selection (or an incoming stream is assembling), every other
    /// walk stays queued, so at most one reply can ever open an incoming
    /// transfer. When this selection's walk drains, a walk that stalled on
    /// the serialization is resumed in its place.
    async fn next_pending_target(&mut self, selection: Atom) -> Result<()> {
        if self.data_conversion_active() {
            return Ok(());
        }
        if let Some(record) = self.selections.get_mut(&selection) {
            if record.pending.is_some() {
                return Ok(());
            }
            if let Some(target) = record.pending_targets.pop_front() {
                return self
                    .issue_conversion(selection, target, NegotiationPhase::AwaitingTargetData)
                    .await;
            }
            set_phase(record, NegotiationPhase::Idle);
        }
        let stalled = self
            .selections
            .values()
            .find(|r| r.pending.is_none() && !r.pending_targets.is_empty())
            .map(|r| r.selection);
        if let Some(other) = stalled {
            if let Some(target) = self
                .selections
                .get_mut(&other)
                .and_then(|r| r.pending_targets.pop_front())
            {
                return self
                    .issue_conversion(other, target, NegotiationPhase::AwaitingTargetData)
                    .await;
            }
        }
        Ok(())
    }

    /// Whether a data conversion is awaited or an incoming stream is live.
    fn data_conversion_active(&self) -> bool {
        self.incoming.is_some()
            || self
                .selections
                .values()
                .any(|r| r.pending.is_some() && r.phase == NegotiationPhase::AwaitingTargetData)
    }

    /// Acquire a slot and send one convert-selection request. A rejected
    /// request aborts this selection's negotiation back to idle rather
    /// than retrying.
    async fn issue_conversion(
        &mut self,
        selection: Atom,
        target: Atom,
        phase: NegotiationPhase,
    ) -> Result<()> {
        let name = self.selection_name(selection);
        let slot = match self.slots.acquire() {
            Ok(slot) => slot,
            Err(e) => {
                self.abort_negotiation(selection, e.to_string());
                return Ok(());
            }
        };
        match self
            .transport
            .convert_selection(self.window, selection, target, slot)
            .await
        {
            Ok(()) => {
                let target_name = self.registry.resolve_name(target).await;
                debug!(
                    "convert '{name}' target '{target_name}' into slot {slot} ({})",
                    phase.label()
                );
                self.stats.conversions_requested += 1;
                if let Some(record) = self.selections.get_mut(&selection) {
                    record.pending = Some(PendingConversion {
                        target,
                        property: slot,
                    });
                    set_phase(record, phase);
                }
                self.transport.flush().await?;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                self.slots.release(slot);
                self.abort_negotiation(selection, format!("conversion request rejected: {e}"));
                Ok(())
            }
        }
    }

    /// Abandon a selection's in-flight negotiation and return it to idle.
    fn abort_negotiation(&mut self, selection: Atom, detail: impl Into<String>) {
        let err = EngineError::Negotiation {
            selection: self.selection_name(selection),
            detail: detail.into(),
        };
        warn!("{err}; returning to idle");
        if let Some(record) = self.selections.get_mut(&selection) {
            if let Some(slot) = record.reset() {
                self.slots.release(slot);
            }
        }
    }

    /// A conversion we issued has completed (or been refused).
    async fn handle_selection_notify(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        if requestor != self.window {
            return Ok(());
        }
        let Some(record) = self.selections.get_mut(&selection) else {
            return Ok(());
        };
        // Match by target, not property: slots are reused round-robin, the
        // pending target uniquely identifies the live request. Anything
        // else is a stale or duplicate delivery and must not mutate state.
        let Some(pending) = record.pending else {
            debug!("ignoring notify with no conversion pending");
            return Ok(());
        };
        if pending.target != target {
            let target_name = self.registry.resolve_name(target).await;
            debug!("ignoring stale notify for target '{target_name}'");
            return Ok(());
        }
        let Some(record) = self.selections.get_mut(&selection) else {
            return Ok(());
        };
        record.pending = None;
        let name = record.name.clone();

        if property.is_none() {
            let target_name = self.registry.resolve_name(target).await;
            warn!("owner refused conversion of '{name}' to '{target_name}'");
            self.slots.release(pending.property);
            self.stats.refusals_received += 1;
            return self.next_pending_target(selection).await;
        }

        let value = match self.channel.read(self.window, property, true).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.slots.release(pending.property);
                self.abort_negotiation(selection, "conversion reply property was empty");
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                self.slots.release(pending.property);
                self.abort_negotiation(selection, format!("property read failed: {e}"));
                return Ok(());
            }
        };

        if target == self.wk.targets {
            self.accept_targets(selection, pending.property, &value)
                .await
        } else {
            self.accept_target_data(selection, pending, &value).await
        }
    }

    /// TARGETS reply: queue every listed target except TARGETS itself, in
    /// delivered order, then start the walk.
    async fn accept_targets(
        &mut self,
        selection: Atom,
        slot: Atom,
        value: &PropertyValue,
    ) -> Result<()> {
        self.slots.release(slot);
        self.stats.conversions_completed += 1;
        let offered = value.as_atoms();
        let name = self.selection_name(selection);
        debug!("'{name}' offers {} targets", offered.len());
        for atom in &offered {
            let target_name = self.registry.resolve_name(*atom).await;
            debug!("  target: '{target_name}'");
        }
        if let Some(record) = self.selections.get_mut(&selection) {
            for atom in offered {
                if atom != self.wk.targets {
                    record.pending_targets.push_back(atom);
                }
            }
        }
        self.next_pending_target(selection).await
    }

    /// Data reply: either the whole value in one shot, or an INCR
    /// announcement opening a chunked stream.
    async fn accept_target_data(
        &mut self,
        selection: Atom,
        pending: PendingConversion,
        value: &PropertyValue,
    ) -> Result<()> {
        self.stats.conversions_completed += 1;
        let target_name = self.registry.resolve_name(pending.target).await;
        let type_name = self.registry.resolve_name(value.type_atom).await;
        debug!(
            "data for target '{target_name}': type '{type_name}', {} bytes",
            value.len()
        );

        if self.channel.is_incr(value) {
            if self.incoming.is_some() {
                self.slots.release(pending.property);
                self.abort_negotiation(selection, "incoming transfer already active");
                return Ok(());
            }
            let announced = value.as_u32().unwrap_or(0);
            info!("INCR stream announced for '{target_name}': {announced} bytes");
            let mut transfer =
                IncomingTransfer::new(selection, pending.property, pending.target, announced);
            match self.store.open_sink(&target_name) {
                Ok(sink) => transfer.sink = Some(sink),
                Err(e) => {
                    self.slots.release(pending.property);
                    self.abort_negotiation(
                        selection,
                        format!("cannot open sink for '{target_name}': {e}"),
                    );
                    return Ok(());
                }
            }
            // The slot stays held until the zero-length terminator; chunks
            // arrive as new-value notifications on our own window.
            self.incoming = Some(transfer);
            return Ok(());
        }

        self.log_value_preview(value).await;
        if !value.is_empty() {
            match self.store.open_sink(&target_name) {
                Ok(mut sink) => {
                    if let Err(e) = sink.write_chunk(&value.data).and_then(|()| sink.close()) {
                        warn!("sink write for '{target_name}' failed: {e}");
                    } else {
                        self.stats.bytes_in += value.len() as u64;
                    }
                }
                Err(e) => warn!("cannot open sink for '{target_name}': {e}"),
            }
        }
        self.slots.release(pending.property);
        self.next_pending_target(selection).await
    }

    /// Echo small numeric/text values to the log, as the audit trail for
    /// one-shot conversions.
    async fn log_value_preview(&self, value: &PropertyValue) {
        if value.type_atom == self.wk.integer || value.type_atom == self.wk.timestamp {
            if let Some(number) = value.as_u32() {
                debug!("  number: {number}");
            }
        } else if self.wk.is_text(value.type_atom) {
            let preview: String = String::from_utf8_lossy(&value.data)
                .chars()
                .take(TEXT_PREVIEW_LEN)
                .collect();
            debug!("  string: '{preview}'");
        }
    }

    // ------------------------------------------------------------------
    // Chunk pumping (both directions)
    // ------------------------------------------------------------------

    /// Property-change traffic: new-value chunks for the incoming stream,
    /// deletion acknowledgments for the outgoing one. Everything else on a
    /// watched window is noise and ignored.
    async fn handle_property_notify(
        &mut self,
        window: Window,
        property: Atom,
        state: PropertyState,
    ) -> Result<()> {
        match state {
            PropertyState::NewValue if window == self.window => {
                let relevant = self
                    .incoming
                    .as_ref()
                    .map(|t| t.property == property)
                    .unwrap_or(false);
                if relevant {
                    self.pump_incoming().await?;
                }
                Ok(())
            }
            PropertyState::Deleted if window != self.window => {
                let relevant = self
                    .outgoing
                    .as_ref()
                    .map(|t| t.requestor == window && t.property == property)
                    .unwrap_or(false);
                if relevant {
                    self.pump_outgoing().await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Read one delivered chunk; zero length ends the stream.
    async fn pump_incoming(&mut self) -> Result<()> {
        let property = match self.incoming.as_ref() {
            Some(transfer) => transfer.property,
            None => return Ok(()),
        };
        let value = match self.channel.read(self.window, property, true).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("chunk read failed: {e}; abandoning incoming transfer");
                return self.finish_incoming(false).await;
            }
        };

        if value.is_empty() {
            // End-of-stream sentinel.
            return self.finish_incoming(true).await;
        }

        let mut write_failed = false;
        if let Some(transfer) = self.incoming.as_mut() {
            transfer.received += value.len() as u64;
            debug!(
                "incoming chunk: {} bytes ({} total of {} announced)",
                value.len(),
                transfer.received,
                transfer.announced
            );
            if let Some(sink) = transfer.sink.as_mut() {
                if let Err(e) = sink.write_chunk(&value.data) {
                    warn!("sink write failed: {e}; abandoning incoming transfer");
                    write_failed = true;
                }
            }
        }
        self.stats.chunks_in += 1;
        self.stats.bytes_in += value.len() as u64;
        if write_failed {
            self.finish_incoming(false).await?;
        }
        Ok(())
    }

    /// Close out the incoming stream and resume the target walk.
    async fn finish_incoming(&mut self, complete: bool) -> Result<()> {
        let Some(mut transfer) = self.incoming.take() else {
            return Ok(());
        };
        if let Some(sink) = transfer.sink.take() {
            if let Err(e) = sink.close() {
                warn!("sink close failed: {e}");
            }
        }
        self.slots.release(transfer.property);
        if complete {
            info!(
                "incoming transfer complete: {} bytes of '{}'",
                transfer.received,
                self.registry.resolve_name(transfer.target).await
            );
        }
        self.next_pending_target(transfer.selection).await
    }

    /// The peer consumed the prior chunk; write the next one. A zero-length
    /// write is the mandatory terminator.
    async fn pump_outgoing(&mut self) -> Result<()> {
        let Some(transfer) = self.outgoing.as_mut() else {
            return Ok(());
        };
        let chunk = match transfer.next_chunk() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("payload read failed: {e}; abandoning outgoing transfer");
                self.outgoing = None;
                return Ok(());
            }
        };
        let requestor = transfer.requestor;
        let property = transfer.property;
        let value = PropertyValue::bytes(transfer.target, chunk.clone());
        match self.channel.write(requestor, property, value).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("chunk write rejected: {e}; abandoning outgoing transfer");
                self.outgoing = None;
                return Ok(());
            }
        }
        if chunk.is_empty() {
            if let Some(transfer) = self.outgoing.take() {
                info!("outgoing transfer complete: {} bytes", transfer.sent);
            }
        } else {
            self.stats.chunks_out += 1;
            self.stats.bytes_out += chunk.len() as u64;
            debug!("outgoing chunk: {} bytes", chunk.len());
        }
        self.transport.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local-as-source: servicing requests
    // ------------------------------------------------------------------

    /// Service one selection-request. Every branch concludes with a
    /// selection-notify; a null property signals refusal, and refused
    /// requests never touch the requestor's property.
    async fn handle_selection_request(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        if requestor == self.window {
            // Self-addressed request; nothing to do.
            return Ok(());
        }
        self.stats.requests_served += 1;
        let target_name = self.registry.resolve_name(target).await;
        debug!(
            "selection request from {requestor}: target '{target_name}' into {property}"
        );

        let mut reply_property = property;
        if target == self.wk.targets {
            if !self.serve_targets(requestor, property).await? {
                reply_property = Atom::NONE;
            }
        } else if target == self.wk.timestamp {
            // Fixed logical clock value (CurrentTime).
            if !self
                .serve_value(requestor, property, PropertyValue::u32(self.wk.integer, 0))
                .await?
            {
                reply_property = Atom::NONE;
            }
        } else if self.wk.is_text(target) {
            let value = PropertyValue::bytes(target, self.text_payload.clone());
            if !self.serve_value(requestor, property, value).await? {
                reply_property = Atom::NONE;
            }
        } else if target == self.native_target {
            if !self.serve_payload(selection, requestor, target, property).await? {
                reply_property = Atom::NONE;
            }
        } else {
            debug!("no data for target '{target_name}'; refusing");
            reply_property = Atom::NONE;
        }

        if reply_property.is_none() {
            self.stats.refusals_sent += 1;
        }
        self.transport
            .send_selection_notify(SelectionNotify {
                requestor,
                selection,
                target,
                property: reply_property,
            })
            .await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Answer TARGETS: the capability list is computed once per request
    /// from whether a payload source is currently available.
    async fn serve_targets(&mut self, requestor: Window, property: Atom) -> Result<bool> {
        let mut capabilities = if self.store.source_len(&self.native_target_name).is_some() {
            vec![self.native_target]
        } else {
            vec![self.wk.string, self.wk.utf8_string]
        };
        capabilities.push(self.wk.targets);
        capabilities.push(self.wk.timestamp);
        for atom in &capabilities {
            let name = self.registry.resolve_name(*atom).await;
            debug!("  offering target '{name}'");
        }
        let value = PropertyValue::atoms(self.wk.atom, &capabilities);
        self.serve_value(requestor, property, value).await
    }

    /// One-shot property write; false means the reply becomes a refusal.
    async fn serve_value(
        &mut self,
        requestor: Window,
        property: Atom,
        value: PropertyValue,
    ) -> Result<bool> {
        match self.channel.write(requestor, property, value).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("reply property write rejected: {e}");
                Ok(false)
            }
        }
    }

    /// Serve the native payload: whole value if it fits in one chunk,
    /// otherwise announce INCR and open the outgoing stream.
    async fn serve_payload(
        &mut self,
        selection: Atom,
        requestor: Window,
        target: Atom,
        property: Atom,
    ) -> Result<bool> {
        let mut source = match self.store.open_source(&self.native_target_name) {
            Ok(Some(source)) => source,
            Ok(None) => {
                debug!("no payload backing '{}'; refusing", self.native_target_name);
                return Ok(false);
            }
            Err(e) => {
                warn!("payload open failed: {e}; refusing");
                return Ok(false);
            }
        };

        if (source.total as usize) < self.chunk_size {
            let mut data = Vec::with_capacity(source.total as usize);
            let mut buf = vec![0u8; self.chunk_size];
            loop {
                match source.read_chunk(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => data.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        warn!("payload read failed: {e}; refusing");
                        return Ok(false);
                    }
                }
            }
            let sent = data.len() as u64;
            let ok = self
                .serve_value(requestor, property, PropertyValue::bytes(target, data))
                .await?;
            if ok {
                self.stats.bytes_out += sent;
            }
            return Ok(ok);
        }

        if self.outgoing.is_some() {
            warn!("outgoing transfer already active; refusing a second");
            return Ok(false);
        }

        // Watch the requestor so its consumption (property deletions)
        // reaches us, then announce the stream.
        match self.transport.watch_properties(self.window, requestor).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("cannot watch requestor {requestor}: {e}; refusing");
                return Ok(false);
            }
        }
        let total = source.total;
        match self.channel.announce_incr(requestor, property, total).await
        {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("INCR announcement rejected: {e}; refusing");
                return Ok(false);
            }
        }
        self.outgoing = Some(OutgoingTransfer::new(
            selection,
            requestor,
            property,
            target,
            self.chunk_size,
            source,
        ));
        Ok(true)
    }

    fn selection_name(&self, selection: Atom) -> String {
        self.selections
            .get(&selection)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| selection.to_string())
    }
}

/// Log a phase transition in one place.
fn set_phase(record: &mut SelectionRecord, phase: NegotiationPhase) {
    if record.phase != phase {
        debug!(
            "selection '{}': {} -> {}",
            record.name,
            record.phase.label(),
            phase.label()
        );
        record.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::payload::MemoryStore;
    use crate::transport::LoopbackTransport;

    async fn make_engine(
        server: &Arc<LoopbackTransport>,
        options: EngineOptions,
    ) -> (SelectionEngine<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        let engine = SelectionEngine::new(
            Arc::clone(server) as Arc<dyn DisplayTransport>,
            store.clone(),
            options,
        )
        .await
        .unwrap();
        (engine, store)
    }

    async fn drain(engine: &mut SelectionEngine<MemoryStore>) {
        while engine.poll_once().await.unwrap() {}
    }

    #[tokio::test]
    async fn test_trigger_claims_unowned_selection() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();

        server.inject_trigger(engine.window(), clipboard);
        drain(&mut engine).await;

        let record = engine.record(clipboard).unwrap();
        assert!(record.owned_by(engine.window()));
        assert_eq!(record.phase, NegotiationPhase::OwnerClaimed);
        assert_eq!(
            server.selection_owner(clipboard).await.unwrap(),
            Some(engine.window())
        );
    }

    #[tokio::test]
    async fn test_targets_reply_queues_list_minus_targets_in_order() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let targets = server.intern_atom("TARGETS").await.unwrap();
        let atom_type = server.intern_atom("ATOM").await.unwrap();
        let png = server.intern_atom("image/png").await.unwrap();
        let string = server.intern_atom("STRING").await.unwrap();
        let timestamp = server.intern_atom("TIMESTAMP").await.unwrap();

        // A peer owns the clipboard; bootstrap issues the TARGETS request.
        let peer = server.create_window().await.unwrap();
        server.set_selection_owner(peer, clipboard).await.unwrap();
        engine.bootstrap().await.unwrap();

        let (req_target, req_property) = match server.poll_event(peer) {
            Some(DisplayEvent::SelectionRequest {
                target, property, ..
            }) => (target, property),
            other => panic!("expected SelectionRequest, got {other:?}"),
        };
        assert_eq!(req_target, targets);

        // Peer answers with a list that includes TARGETS itself.
        let offered = [png, string, targets, timestamp];
        server
            .change_property(
                engine.window(),
                req_property,
                PropertyValue::atoms(atom_type, &offered),
            )
            .await
            .unwrap();
        server
            .send_selection_notify(SelectionNotify {
                requestor: engine.window(),
                selection: clipboard,
                target: targets,
                property: req_property,
            })
            .await
            .unwrap();
        drain(&mut engine).await;

        // The first non-TARGETS target is already in flight; the rest are
        // queued in delivered order.
        let record = engine.record(clipboard).unwrap();
        assert_eq!(record.pending.unwrap().target, png);
        let queued: Vec<Atom> = record.pending_targets.iter().copied().collect();
        assert_eq!(queued, vec![string, timestamp]);
        assert_eq!(record.phase, NegotiationPhase::AwaitingTargetData);
        assert_eq!(engine.slots_held(), 1);
    }

    #[tokio::test]
    async fn test_stale_notify_is_ignored_without_mutation() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let bogus = server.intern_atom("text/rtf").await.unwrap();
        let prop = server.intern_atom("CUT_BUFFER5").await.unwrap();

        let peer = server.create_window().await.unwrap();
        server.set_selection_owner(peer, clipboard).await.unwrap();
        engine.bootstrap().await.unwrap();
        let _ = server.poll_event(peer);

        let before_phase = engine.record(clipboard).unwrap().phase;
        let before_pending = engine.record(clipboard).unwrap().pending;

        // A notify for a target that was never requested.
        server
            .send_selection_notify(SelectionNotify {
                requestor: engine.window(),
                selection: clipboard,
                target: bogus,
                property: prop,
            })
            .await
            .unwrap();
        drain(&mut engine).await;

        let record = engine.record(clipboard).unwrap();
        assert_eq!(record.phase, before_phase);
        assert_eq!(record.pending, before_pending);
        assert!(record.pending_targets.is_empty());
        assert!(!engine.incoming_active());
    }

    #[tokio::test]
    async fn test_empty_reply_property_abandons_negotiation() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let targets = server.intern_atom("TARGETS").await.unwrap();

        let peer = server.create_window().await.unwrap();
        server.set_selection_owner(peer, clipboard).await.unwrap();
        engine.bootstrap().await.unwrap();
        let _ = server.poll_event(peer);

        // Notify names the reply slot but the owner never wrote it.
        let pending = engine.record(clipboard).unwrap().pending.unwrap();
        server
            .send_selection_notify(SelectionNotify {
                requestor: engine.window(),
                selection: clipboard,
                target: targets,
                property: pending.property,
            })
            .await
            .unwrap();
        drain(&mut engine).await;

        let record = engine.record(clipboard).unwrap();
        assert_eq!(record.phase, NegotiationPhase::Idle);
        assert!(record.pending.is_none());
        assert!(record.pending_targets.is_empty());
        assert_eq!(engine.slots_held(), 0);
    }

    #[tokio::test]
    async fn test_refused_conversion_moves_to_next_target() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let targets = server.intern_atom("TARGETS").await.unwrap();

        let peer = server.create_window().await.unwrap();
        server.set_selection_owner(peer, clipboard).await.unwrap();
        engine.bootstrap().await.unwrap();
        let _ = server.poll_event(peer);

        // Refusal notify for the pending TARGETS request.
        server
            .send_selection_notify(SelectionNotify {
                requestor: engine.window(),
                selection: clipboard,
                target: targets,
                property: Atom::NONE,
            })
            .await
            .unwrap();
        drain(&mut engine).await;

        let record = engine.record(clipboard).unwrap();
        assert_eq!(record.phase, NegotiationPhase::Idle);
        assert!(record.pending.is_none());
        assert_eq!(engine.slots_held(), 0);
        assert_eq!(engine.stats().refusals_received, 1);
    }

    #[tokio::test]
    async fn test_unsupported_request_gets_null_property_and_no_write() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let rtf = server.intern_atom("text/rtf").await.unwrap();
        let prop = server.intern_atom("PEER_PROP").await.unwrap();

        server.inject_trigger(engine.window(), clipboard);
        drain(&mut engine).await;

        let peer = server.create_window().await.unwrap();
        server
            .convert_selection(peer, clipboard, rtf, prop)
            .await
            .unwrap();
        drain(&mut engine).await;

        match server.poll_event(peer) {
            Some(DisplayEvent::SelectionNotify {
                property, target, ..
            }) => {
                assert!(property.is_none());
                assert_eq!(target, rtf);
            }
            other => panic!("expected refusal notify, got {other:?}"),
        }
        assert!(server.property(peer, prop).is_none());
        assert_eq!(engine.stats().refusals_sent, 1);
    }

    #[tokio::test]
    async fn test_targets_request_without_payload_offers_text() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let targets = server.intern_atom("TARGETS").await.unwrap();
        let string = server.intern_atom("STRING").await.unwrap();
        let utf8 = server.intern_atom("UTF8_STRING").await.unwrap();
        let timestamp = server.intern_atom("TIMESTAMP").await.unwrap();
        let prop = server.intern_atom("PEER_PROP").await.unwrap();

        server.inject_trigger(engine.window(), clipboard);
        drain(&mut engine).await;

        let peer = server.create_window().await.unwrap();
        server
            .convert_selection(peer, clipboard, targets, prop)
            .await
            .unwrap();
        drain(&mut engine).await;

        let value = server.property(peer, prop).unwrap();
        assert_eq!(value.as_atoms(), vec![string, utf8, targets, timestamp]);
    }

    #[tokio::test]
    async fn test_targets_request_with_payload_offers_native_type() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, store) = make_engine(&server, EngineOptions::default()).await;
        store.insert("image/png", vec![1; 16]);
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let targets = server.intern_atom("TARGETS").await.unwrap();
        let png = server.intern_atom("image/png").await.unwrap();
        let timestamp = server.intern_atom("TIMESTAMP").await.unwrap();
        let prop = server.intern_atom("PEER_PROP").await.unwrap();

        server.inject_trigger(engine.window(), clipboard);
        drain(&mut engine).await;

        let peer = server.create_window().await.unwrap();
        server
            .convert_selection(peer, clipboard, targets, prop)
            .await
            .unwrap();
        drain(&mut engine).await;

        let value = server.property(peer, prop).unwrap();
        assert_eq!(value.as_atoms(), vec![png, targets, timestamp]);
    }

    #[tokio::test]
    async fn test_timestamp_request_served_as_integer() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();
        let timestamp = server.intern_atom("TIMESTAMP").await.unwrap();
        let integer = server.intern_atom("INTEGER").await.unwrap();
        let prop = server.intern_atom("PEER_PROP").await.unwrap();

        server.inject_trigger(engine.window(), clipboard);
        drain(&mut engine).await;

        let peer = server.create_window().await.unwrap();
        server
            .convert_selection(peer, clipboard, timestamp, prop)
            .await
            .unwrap();
        drain(&mut engine).await;

        let value = server.property(peer, prop).unwrap();
        assert_eq!(value.type_atom, integer);
        assert_eq!(value.as_u32(), Some(0));
    }

    #[tokio::test]
    async fn test_repeated_owner_queries_are_idempotent() {
        let server = Arc::new(LoopbackTransport::new());
        let (mut engine, _store) = make_engine(&server, EngineOptions::default()).await;
        let clipboard = server.intern_atom("CLIPBOARD").await.unwrap();

        let peer = server.create_window().await.unwrap();
        server.set_selection_owner(peer, clipboard).await.unwrap();

        for _ in 0..3 {
            let owner = engine.query_owner(clipboard).await.unwrap();
            assert_eq!(owner, Some(peer));
            assert_eq!(engine.record(clipboard).unwrap().owner, Some(peer));
        }
    }
}
