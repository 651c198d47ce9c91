//! Atom Name Registry
//!
//! Bidirectional cache mapping symbolic resource names to interned atoms.
//! Cache hits return immediately; misses do one round trip to the server
//! and memoize both directions. The registry never evicts — the domain of
//! distinct names is small and bounded by protocol convention.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::transport::{Atom, DisplayTransport, Result};

/// Name returned for an atom the server cannot resolve either.
pub const UNKNOWN_ATOM_NAME: &str = "Unknown";

/// Names interned eagerly at startup so the hot paths never miss.
const PRECACHE_NAMES: &[&str] = &[
    "PRIMARY",
    "SECONDARY",
    "CLIPBOARD",
    "TARGETS",
    "INCR",
    "TIMESTAMP",
    "ATOM",
    "INTEGER",
    "STRING",
    "UTF8_STRING",
    "TEXT",
    "CUT_BUFFER0",
    "CUT_BUFFER1",
    "CUT_BUFFER2",
    "CUT_BUFFER3",
    "CUT_BUFFER4",
    "CUT_BUFFER5",
    "CUT_BUFFER6",
    "CUT_BUFFER7",
    "text/plain",
    "text/html",
    "image/png",
    "image/jpeg",
    "image/bmp",
];

/// Bidirectional name⇄atom cache over a display transport.
pub struct AtomRegistry {
    transport: Arc<dyn DisplayTransport>,
    forward: Mutex<HashMap<String, Atom>>,
    reverse: Mutex<HashMap<Atom, String>>,
}

impl AtomRegistry {
    /// Create an empty registry over the given transport.
    pub fn new(transport: Arc<dyn DisplayTransport>) -> Self {
        Self {
            transport,
            forward: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
        }
    }

    /// Intern the well-known protocol names in one startup pass.
    pub async fn precache(&self) -> Result<()> {
        for name in PRECACHE_NAMES {
            self.resolve(name).await?;
        }
        debug!("pre-cached {} atom names", PRECACHE_NAMES.len());
        Ok(())
    }

    /// Resolve a name to its atom, memoizing on miss.
    pub async fn resolve(&self, name: &str) -> Result<Atom> {
        if let Some(atom) = self.forward.lock().get(name) {
            return Ok(*atom);
        }
        let atom = self.transport.intern_atom(name).await?;
        self.memoize(name, atom);
        Ok(atom)
    }

    /// Resolve an atom to its name.
    ///
    /// Never fails the caller: an id the server cannot resolve either yields
    /// the [`UNKNOWN_ATOM_NAME`] sentinel, which is not memoized.
    pub async fn resolve_name(&self, atom: Atom) -> String {
        if atom.is_none() {
            return "(null)".to_string();
        }
        if let Some(name) = self.reverse.lock().get(&atom) {
            return name.clone();
        }
        match self.transport.atom_name(atom).await {
            Ok(name) => {
                self.memoize(&name, atom);
                name
            }
            Err(e) => {
                warn!("atom {} has no resolvable name: {}", atom, e);
                UNKNOWN_ATOM_NAME.to_string()
            }
        }
    }

    fn memoize(&self, name: &str, atom: Atom) {
        self.forward.lock().insert(name.to_string(), atom);
        self.reverse.lock().insert(atom, name.to_string());
    }

    /// Number of cached names (diagnostic).
    pub fn len(&self) -> usize {
        self.forward.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.forward.lock().is_empty()
    }
}

/// Atoms the engine compares against on every event.
///
/// Resolved once at startup so the state machine never awaits the registry
/// on its hot path.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownAtoms {
    /// TARGETS — capability-list meta target
    pub targets: Atom,
    /// INCR — chunked-continuation sentinel type
    pub incr: Atom,
    /// TIMESTAMP — logical clock target
    pub timestamp: Atom,
    /// ATOM — type of atom-list properties
    pub atom: Atom,
    /// INTEGER — type of numeric properties
    pub integer: Atom,
    /// STRING — Latin-1 text
    pub string: Atom,
    /// UTF8_STRING — UTF-8 text
    pub utf8_string: Atom,
}

impl WellKnownAtoms {
    /// Resolve the full set through the registry.
    pub async fn resolve(registry: &AtomRegistry) -> Result<Self> {
        Ok(Self {
            targets: registry.resolve("TARGETS").await?,
            incr: registry.resolve("INCR").await?,
            timestamp: registry.resolve("TIMESTAMP").await?,
            atom: registry.resolve("ATOM").await?,
            integer: registry.resolve("INTEGER").await?,
            string: registry.resolve("STRING").await?,
            utf8_string: registry.resolve("UTF8_STRING").await?,
        })
    }

    /// Whether `target` is one of the textual representations.
    pub fn is_text(&self, target: Atom) -> bool {
        target == self.string || target == self.utf8_string
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn test_resolve_memoizes_both_directions() {
        let server = Arc::new(LoopbackTransport::new());
        let registry = AtomRegistry::new(server.clone());

        let atom = registry.resolve("CLIPBOARD").await.unwrap();
        assert_eq!(registry.resolve("CLIPBOARD").await.unwrap(), atom);
        assert_eq!(registry.resolve_name(atom).await, "CLIPBOARD");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_atom_yields_sentinel() {
        let server = Arc::new(LoopbackTransport::new());
        let registry = AtomRegistry::new(server);

        assert_eq!(registry.resolve_name(Atom(999)).await, UNKNOWN_ATOM_NAME);
        // Sentinel is not memoized; a later interning can still claim the id.
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_precache_covers_protocol_names() {
        let server = Arc::new(LoopbackTransport::new());
        let registry = AtomRegistry::new(server);

        registry.precache().await.unwrap();
        assert_eq!(registry.len(), PRECACHE_NAMES.len());

        let targets = registry.resolve("TARGETS").await.unwrap();
        assert_eq!(registry.resolve_name(targets).await, "TARGETS");
    }
}
