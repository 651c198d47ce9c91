//! Property Transport
//!
//! Thin wrapper over the display transport for the engine's property
//! traffic. Owns the one protocol subtlety worth isolating: a zero-length
//! value of type INCR announces a chunked transfer, not an empty value —
//! the branch is on the announced type, never on length alone.

use std::sync::Arc;

use tracing::debug;

use crate::transport::{Atom, DisplayTransport, PropertyValue, Result, Window};

/// Property read/write channel with INCR awareness.
pub struct PropertyChannel {
    transport: Arc<dyn DisplayTransport>,
    incr: Atom,
}

impl PropertyChannel {
    /// Channel over `transport`; `incr` is the interned INCR sentinel type.
    pub fn new(transport: Arc<dyn DisplayTransport>, incr: Atom) -> Self {
        Self { transport, incr }
    }

    /// Replace a property's full content.
    ///
    /// On rejection the caller must treat the write as not-delivered and
    /// must not advance transfer state.
    pub async fn write(&self, window: Window, property: Atom, value: PropertyValue) -> Result<()> {
        self.transport.change_property(window, property, value).await
    }

    /// Read a property; `delete` acknowledges consumption (and, during an
    /// outgoing transfer, triggers the peer's next chunk).
    pub async fn read(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<PropertyValue>> {
        self.transport.get_property(window, property, delete).await
    }

    /// Announce a large transfer: a 4-byte length prefix of type INCR
    /// written to the destination property before any chunk. The prefix is
    /// advisory; totals beyond the 32-bit range are clamped, never wrapped.
    pub async fn announce_incr(&self, window: Window, property: Atom, total: u64) -> Result<()> {
        let announced = u32::try_from(total).unwrap_or(u32::MAX);
        debug!("announcing INCR transfer: {} bytes to {window}", total);
        self.write(window, property, PropertyValue::u32(self.incr, announced))
            .await
    }

    /// Whether this value is an INCR announcement.
    pub fn is_incr(&self, value: &PropertyValue) -> bool {
        value.type_atom == self.incr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn test_incr_branch_is_on_type_not_length() {
        let server = Arc::new(LoopbackTransport::new());
        let incr = server.intern_atom("INCR").await.unwrap();
        let string = server.intern_atom("STRING").await.unwrap();
        let channel = PropertyChannel::new(server.clone(), incr);

        // Zero-length STRING is an empty value, not an announcement.
        assert!(!channel.is_incr(&PropertyValue::bytes(string, Vec::new())));
        // A 4-byte INCR value is an announcement.
        assert!(channel.is_incr(&PropertyValue::u32(incr, 1024)));
    }

    #[tokio::test]
    async fn test_announce_clamps_oversized_total() {
        let server = Arc::new(LoopbackTransport::new());
        let incr = server.intern_atom("INCR").await.unwrap();
        let prop = server.intern_atom("CUT_BUFFER0").await.unwrap();
        let window = server.create_window().await.unwrap();
        let channel = PropertyChannel::new(server.clone(), incr);

        channel
            .announce_incr(window, prop, 5 * 1024 * 1024 * 1024)
            .await
            .unwrap();
        let value = channel.read(window, prop, true).await.unwrap().unwrap();
        assert!(channel.is_incr(&value));
        assert_eq!(value.as_u32(), Some(u32::MAX));
    }

    #[tokio::test]
    async fn test_write_read_delete_cycle() {
        let server = Arc::new(LoopbackTransport::new());
        let incr = server.intern_atom("INCR").await.unwrap();
        let string = server.intern_atom("STRING").await.unwrap();
        let prop = server.intern_atom("CUT_BUFFER0").await.unwrap();
        let window = server.create_window().await.unwrap();
        let channel = PropertyChannel::new(server.clone(), incr);

        channel
            .write(window, prop, PropertyValue::bytes(string, b"hello".to_vec()))
            .await
            .unwrap();
        let value = channel.read(window, prop, true).await.unwrap().unwrap();
        assert_eq!(value.data, b"hello");
        assert!(channel.read(window, prop, false).await.unwrap().is_none());
    }
}
