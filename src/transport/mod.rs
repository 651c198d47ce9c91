//! Display Transport Abstraction
//!
//! Defines a unified interface for display-server backends. The selection
//! engine calls transport methods without knowing which backend is active;
//! an X11 backend lives outside this crate, while [`LoopbackTransport`]
//! provides an in-process display server for demos and tests.
//!
//! The trait covers exactly the protocol surface the engine needs: atom
//! interning, selection ownership, conversion requests, window properties,
//! selection-notify delivery, and non-blocking event polling.

use async_trait::async_trait;
use thiserror::Error;

mod loopback;

pub use loopback::LoopbackTransport;

/// Interned identifier for a symbolic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(pub u32);

impl Atom {
    /// The "no atom" sentinel (`None` property in selection-notify means refusal).
    pub const NONE: Atom = Atom(0);

    /// Whether this is the null atom.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side window identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window(pub u32);

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Transport-level errors.
///
/// `ConnectionLost` is fatal and terminates the run. `Rejected` is a
/// request-level protocol error; the engine treats the request as
/// not-delivered and recovers locally (the selection returns to idle,
/// transfer state does not advance).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Display connection is broken. Fatal.
    #[error("display connection lost: {0}")]
    ConnectionLost(String),

    /// A single request was refused by the server.
    #[error("{op} rejected: {detail}")]
    Rejected {
        /// Protocol operation that failed
        op: &'static str,
        /// Server-reported detail
        detail: String,
    },
}

impl TransportError {
    /// Whether this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

/// Transport result alias.
pub type Result<T> = std::result::Result<T, TransportError>;

/// State reported by a property-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyState {
    /// The property was replaced with a new value.
    NewValue,
    /// The property was deleted (read with the delete flag, or explicitly).
    Deleted,
}

/// One unit of protocol traffic delivered to a window.
///
/// All backends translate their native events into this common type before
/// queueing them for [`DisplayTransport::poll_event`].
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    /// A conversion we requested has completed (or been refused).
    SelectionNotify {
        /// Window that issued the conversion request
        requestor: Window,
        /// Selection the conversion was for
        selection: Atom,
        /// Target representation that was requested
        target: Atom,
        /// Property holding the result; [`Atom::NONE`] signals refusal
        property: Atom,
    },

    /// A peer asks us (the owner) to convert the selection.
    SelectionRequest {
        /// Current owner window (us)
        owner: Window,
        /// Window asking for the data
        requestor: Window,
        /// Selection being converted
        selection: Atom,
        /// Representation the peer wants
        target: Atom,
        /// Property on the requestor to write the result into
        property: Atom,
    },

    /// We lost ownership of a selection.
    SelectionClear {
        /// Previous owner (us, if this event is addressed to us)
        owner: Window,
        /// Selection that was taken
        selection: Atom,
    },

    /// A watched window's property changed.
    PropertyNotify {
        /// Window the property lives on
        window: Window,
        /// Property that changed
        property: Atom,
        /// New-value or deleted
        state: PropertyState,
    },

    /// Transport-reported local user gesture asking us to claim a selection.
    OwnershipTrigger {
        /// Selection to claim
        selection: Atom,
    },
}

/// Typed content of a window property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    /// Announced type of the value
    pub type_atom: Atom,
    /// Unit width in bits (8, 16, or 32)
    pub format: u8,
    /// Raw bytes, little-endian for 16/32-bit formats
    pub data: Vec<u8>,
}

impl PropertyValue {
    /// Byte value of format 8 and the given type.
    pub fn bytes(type_atom: Atom, data: Vec<u8>) -> Self {
        Self {
            type_atom,
            format: 8,
            data,
        }
    }

    /// List-of-atoms value (format 32, type ATOM supplied by the caller).
    pub fn atoms(type_atom: Atom, atoms: &[Atom]) -> Self {
        let mut data = Vec::with_capacity(atoms.len() * 4);
        for a in atoms {
            data.extend_from_slice(&a.0.to_le_bytes());
        }
        Self {
            type_atom,
            format: 32,
            data,
        }
    }

    /// Single 32-bit integer value of the given type.
    pub fn u32(type_atom: Atom, value: u32) -> Self {
        Self {
            type_atom,
            format: 32,
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Decode the value as a list of atoms. Trailing partial words ignored.
    pub fn as_atoms(&self) -> Vec<Atom> {
        self.data
            .chunks_exact(4)
            .map(|c| Atom(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    }

    /// Decode the value as a single 32-bit integer, if it is exactly one.
    pub fn as_u32(&self) -> Option<u32> {
        if self.data.len() == 4 {
            Some(u32::from_le_bytes([
                self.data[0],
                self.data[1],
                self.data[2],
                self.data[3],
            ]))
        } else {
            None
        }
    }

    /// Byte length of the value.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fields of a selection-notify acknowledgment sent to a requestor.
///
/// Every serviced selection-request concludes with one of these; a
/// [`Atom::NONE`] property signals refusal.
#[derive(Debug, Clone, Copy)]
pub struct SelectionNotify {
    /// Window the notify is delivered to
    pub requestor: Window,
    /// Selection the request was for
    pub selection: Atom,
    /// Target that was requested
    pub target: Atom,
    /// Property holding the result, or [`Atom::NONE`]
    pub property: Atom,
}

/// Display-server backend interface.
///
/// Implementations must deliver events to each window in protocol order;
/// the engine processes them strictly in the order polled.
#[async_trait]
pub trait DisplayTransport: Send + Sync {
    /// Backend name for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Intern a symbolic name, returning its atom.
    async fn intern_atom(&self, name: &str) -> Result<Atom>;

    /// Look up the name of an atom. Errors if the server does not know it.
    async fn atom_name(&self, atom: Atom) -> Result<String>;

    /// Create an unmapped helper window for selection traffic.
    async fn create_window(&self) -> Result<Window>;

    /// Destroy a window created by [`Self::create_window`].
    async fn destroy_window(&self, window: Window) -> Result<()>;

    /// Subscribe `watcher` to property-change notifications on `target`.
    ///
    /// Required on our own window for incoming INCR chunks and on the
    /// requestor's window for outgoing INCR consumption signals.
    async fn watch_properties(&self, watcher: Window, target: Window) -> Result<()>;

    /// Query the current owner of a selection.
    async fn selection_owner(&self, selection: Atom) -> Result<Option<Window>>;

    /// Assert `owner` as the owner of `selection`.
    async fn set_selection_owner(&self, owner: Window, selection: Atom) -> Result<()>;

    /// Ask the current owner to convert `selection` to `target`, placing the
    /// result in `property` on `requestor`.
    async fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()>;

    /// Replace a property's full content.
    async fn change_property(
        &self,
        window: Window,
        property: Atom,
        value: PropertyValue,
    ) -> Result<()>;

    /// Read a property, optionally deleting it as a side effect.
    ///
    /// The delete flag acknowledges consumption and, during an outgoing
    /// transfer, triggers the peer's next chunk.
    async fn get_property(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<PropertyValue>>;

    /// Send a selection-notify acknowledgment to a peer window.
    async fn send_selection_notify(&self, notify: SelectionNotify) -> Result<()>;

    /// Non-blocking poll for the next event addressed to `window`.
    fn poll_event(&self, window: Window) -> Option<DisplayEvent>;

    /// Connection-health predicate. A broken connection is fatal.
    fn connection_ok(&self) -> bool;

    /// Flush buffered requests to the server.
    async fn flush(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_list_codec() {
        let atoms = [Atom(1), Atom(250), Atom(65_540)];
        let value = PropertyValue::atoms(Atom(4), &atoms);
        assert_eq!(value.format, 32);
        assert_eq!(value.as_atoms(), atoms);
    }

    #[test]
    fn test_u32_value() {
        let value = PropertyValue::u32(Atom(19), 0xDEAD_BEEF);
        assert_eq!(value.as_u32(), Some(0xDEAD_BEEF));
        assert_eq!(value.len(), 4);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::ConnectionLost("eof".into()).is_fatal());
        assert!(!TransportError::Rejected {
            op: "convert_selection",
            detail: "bad window".into()
        }
        .is_fatal());
    }
}
