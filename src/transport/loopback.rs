//! In-Process Loopback Display Server
//!
//! Implements [`DisplayTransport`] against an in-memory display server:
//! atom table, window table with per-window properties, selection owner
//! table, and ordered per-window event queues. Two engines attached to the
//! same loopback see each other exactly as two clients of one X server
//! would, including property-change fan-out to watching windows.
//!
//! This is the demo and test backend; real display backends are external
//! collaborators and live outside this crate.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    Atom, DisplayEvent, DisplayTransport, PropertyState, PropertyValue, Result, SelectionNotify,
    TransportError, Window,
};

#[derive(Debug, Default)]
struct WindowState {
    properties: HashMap<Atom, PropertyValue>,
    queue: VecDeque<DisplayEvent>,
    watchers: Vec<Window>,
}

#[derive(Debug)]
struct Inner {
    atoms: HashMap<String, Atom>,
    names: HashMap<Atom, String>,
    next_atom: u32,
    windows: HashMap<Window, WindowState>,
    next_window: u32,
    owners: HashMap<Atom, Window>,
    connected: bool,
}

impl Inner {
    fn window_mut(&mut self, window: Window) -> Result<&mut WindowState> {
        self.windows
            .get_mut(&window)
            .ok_or(TransportError::Rejected {
                op: "window lookup",
                detail: format!("unknown window {window}"),
            })
    }

    /// Queue a PropertyNotify for every watcher of `window`.
    fn fan_out(&mut self, window: Window, property: Atom, state: PropertyState) {
        let watchers = match self.windows.get(&window) {
            Some(w) => w.watchers.clone(),
            None => return,
        };
        for watcher in watchers {
            if let Some(w) = self.windows.get_mut(&watcher) {
                w.queue.push_back(DisplayEvent::PropertyNotify {
                    window,
                    property,
                    state,
                });
            }
        }
    }

    fn deliver(&mut self, window: Window, event: DisplayEvent) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.queue.push_back(event);
        }
    }
}

/// Shared in-memory display server.
#[derive(Debug)]
pub struct LoopbackTransport {
    inner: Mutex<Inner>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create an empty loopback server.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                atoms: HashMap::new(),
                names: HashMap::new(),
                next_atom: 1,
                windows: HashMap::new(),
                next_window: 1,
                owners: HashMap::new(),
                connected: true,
            }),
        }
    }

    /// Simulate a local user gesture asking `window`'s engine to claim
    /// `selection`.
    pub fn inject_trigger(&self, window: Window, selection: Atom) {
        let mut inner = self.inner.lock();
        inner.deliver(window, DisplayEvent::OwnershipTrigger { selection });
    }

    /// Break the connection; every subsequent call fails fatally.
    pub fn disconnect(&self) {
        self.inner.lock().connected = false;
    }

    /// Direct read of a window property, for assertions.
    pub fn property(&self, window: Window, property: Atom) -> Option<PropertyValue> {
        let inner = self.inner.lock();
        inner
            .windows
            .get(&window)
            .and_then(|w| w.properties.get(&property).cloned())
    }

    /// Number of undelivered events queued for `window`.
    pub fn queued_events(&self, window: Window) -> usize {
        let inner = self.inner.lock();
        inner.windows.get(&window).map_or(0, |w| w.queue.len())
    }

    fn check(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if inner.connected {
            Ok(inner)
        } else {
            Err(TransportError::ConnectionLost(
                "loopback disconnected".into(),
            ))
        }
    }
}

#[async_trait]
impl DisplayTransport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn intern_atom(&self, name: &str) -> Result<Atom> {
        let mut inner = self.check()?;
        if let Some(atom) = inner.atoms.get(name) {
            return Ok(*atom);
        }
        let atom = Atom(inner.next_atom);
        inner.next_atom += 1;
        inner.atoms.insert(name.to_string(), atom);
        inner.names.insert(atom, name.to_string());
        trace!("loopback interned '{}' as {}", name, atom);
        Ok(atom)
    }

    async fn atom_name(&self, atom: Atom) -> Result<String> {
        let inner = self.check()?;
        inner
            .names
            .get(&atom)
            .cloned()
            .ok_or(TransportError::Rejected {
                op: "atom_name",
                detail: format!("no atom with id {atom}"),
            })
    }

    async fn create_window(&self) -> Result<Window> {
        let mut inner = self.check()?;
        let window = Window(inner.next_window);
        inner.next_window += 1;
        inner.windows.insert(window, WindowState::default());
        Ok(window)
    }

    async fn destroy_window(&self, window: Window) -> Result<()> {
        let mut inner = self.check()?;
        inner.windows.remove(&window);
        inner.owners.retain(|_, owner| *owner != window);
        for w in inner.windows.values_mut() {
            w.watchers.retain(|watcher| *watcher != window);
        }
        Ok(())
    }

    async fn watch_properties(&self, watcher: Window, target: Window) -> Result<()> {
        let mut inner = self.check()?;
        let state = inner.window_mut(target)?;
        if !state.watchers.contains(&watcher) {
            state.watchers.push(watcher);
        }
        Ok(())
    }

    async fn selection_owner(&self, selection: Atom) -> Result<Option<Window>> {
        let inner = self.check()?;
        Ok(inner.owners.get(&selection).copied())
    }

    async fn set_selection_owner(&self, owner: Window, selection: Atom) -> Result<()> {
        let mut inner = self.check()?;
        if !inner.windows.contains_key(&owner) {
            return Err(TransportError::Rejected {
                op: "set_selection_owner",
                detail: format!("unknown window {owner}"),
            });
        }
        let previous = inner.owners.insert(selection, owner);
        if let Some(previous) = previous {
            if previous != owner {
                inner.deliver(
                    previous,
                    DisplayEvent::SelectionClear {
                        owner: previous,
                        selection,
                    },
                );
            }
        }
        Ok(())
    }

    async fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
    ) -> Result<()> {
        let mut inner = self.check()?;
        if !inner.windows.contains_key(&requestor) {
            return Err(TransportError::Rejected {
                op: "convert_selection",
                detail: format!("unknown requestor {requestor}"),
            });
        }
        match inner.owners.get(&selection).copied() {
            Some(owner) => inner.deliver(
                owner,
                DisplayEvent::SelectionRequest {
                    owner,
                    requestor,
                    selection,
                    target,
                    property,
                },
            ),
            // No owner: the server answers with a refusal notify itself.
            None => inner.deliver(
                requestor,
                DisplayEvent::SelectionNotify {
                    requestor,
                    selection,
                    target,
                    property: Atom::NONE,
                },
            ),
        }
        Ok(())
    }

    async fn change_property(
        &self,
        window: Window,
        property: Atom,
        value: PropertyValue,
    ) -> Result<()> {
        let mut inner = self.check()?;
        inner.window_mut(window)?.properties.insert(property, value);
        inner.fan_out(window, property, PropertyState::NewValue);
        Ok(())
    }

    async fn get_property(
        &self,
        window: Window,
        property: Atom,
        delete: bool,
    ) -> Result<Option<PropertyValue>> {
        let mut inner = self.check()?;
        let state = inner.window_mut(window)?;
        let value = if delete {
            state.properties.remove(&property)
        } else {
            state.properties.get(&property).cloned()
        };
        if delete && value.is_some() {
            inner.fan_out(window, property, PropertyState::Deleted);
        }
        Ok(value)
    }

    async fn send_selection_notify(&self, notify: SelectionNotify) -> Result<()> {
        let mut inner = self.check()?;
        inner.deliver(
            notify.requestor,
            DisplayEvent::SelectionNotify {
                requestor: notify.requestor,
                selection: notify.selection,
                target: notify.target,
                property: notify.property,
            },
        );
        Ok(())
    }

    fn poll_event(&self, window: Window) -> Option<DisplayEvent> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return None;
        }
        inner
            .windows
            .get_mut(&window)
            .and_then(|w| w.queue.pop_front())
    }

    fn connection_ok(&self) -> bool {
        self.inner.lock().connected
    }

    async fn flush(&self) -> Result<()> {
        self.check().map(|_| ())
    }
}
