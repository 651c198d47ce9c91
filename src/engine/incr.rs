//! INCR Transfer Records
//!
//! Bookkeeping for the two chunked-transfer directions. At most one of
//! each may be live process-wide; the chunk size is fixed at transfer
//! creation and constant for its life.

use crate::engine::payload::{PayloadSink, PayloadSource};
use crate::transport::{Atom, Window};

/// Default chunk size, chosen to stay under remote max-request-length
/// limits on stock servers.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A chunked transfer we are receiving (local-as-sink).
///
/// Created when a conversion reply announces INCR; each new-value
/// property notification appends a chunk, and a zero-length chunk is the
/// end-of-stream sentinel.
#[derive(Debug)]
pub struct IncomingTransfer {
    /// Selection the conversion belonged to
    pub selection: Atom,
    /// Property the chunks arrive in (a held pool slot)
    pub property: Atom,
    /// Target representation being received
    pub target: Atom,
    /// Total announced by the INCR prefix, if the peer sent one
    pub announced: u32,
    /// Bytes appended so far
    pub received: u64,
    /// Open sink for the payload
    pub sink: Option<PayloadSink>,
}

impl IncomingTransfer {
    /// Record a fresh incoming stream.
    pub fn new(selection: Atom, property: Atom, target: Atom, announced: u32) -> Self {
        Self {
            selection,
            property,
            target,
            announced,
            received: 0,
            sink: None,
        }
    }
}

/// A chunked transfer we are sending (local-as-source).
///
/// Created when a requestor's target cannot fit in one property write.
/// Each deletion of the destination property (the peer consuming the prior
/// chunk) triggers the next write; a zero-length write terminates and is
/// mandatory even when the payload ends exactly on a chunk boundary.
#[derive(Debug)]
pub struct OutgoingTransfer {
    /// Selection being served
    pub selection: Atom,
    /// Requestor window the chunks go to
    pub requestor: Window,
    /// Destination property on the requestor
    pub property: Atom,
    /// Target representation being sent
    pub target: Atom,
    /// Chunk size fixed for the life of this transfer
    pub chunk_size: usize,
    /// Bytes written so far
    pub sent: u64,
    /// Open source for the payload
    pub source: PayloadSource,
}

impl OutgoingTransfer {
    /// Record a fresh outgoing stream.
    pub fn new(
        selection: Atom,
        requestor: Window,
        property: Atom,
        target: Atom,
        chunk_size: usize,
        source: PayloadSource,
    ) -> Self {
        Self {
            selection,
            requestor,
            property,
            target,
            chunk_size,
            sent: 0,
            source,
        }
    }

    /// Read the next chunk from the source. Empty means finished.
    pub fn next_chunk(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self.source.read_chunk(&mut buf)?;
        buf.truncate(n);
        self.sent += n as u64;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_chunk_honors_fixed_size_and_terminates() {
        let payload = vec![0xAB; 10];
        let source = PayloadSource::new(Box::new(std::io::Cursor::new(payload)), 10);
        let mut transfer =
            OutgoingTransfer::new(Atom(1), Window(2), Atom(3), Atom(4), 4, source);

        assert_eq!(transfer.next_chunk().unwrap().len(), 4);
        assert_eq!(transfer.next_chunk().unwrap().len(), 4);
        assert_eq!(transfer.next_chunk().unwrap().len(), 2);
        // Mandatory zero-length terminator even after the short tail.
        assert!(transfer.next_chunk().unwrap().is_empty());
        assert_eq!(transfer.sent, 10);
    }
}
