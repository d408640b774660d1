//! Passive listener registry
//!
//! Listeners observe pool activity without issuing calls of their own:
//! connection open/close, protocol errors, and every `command_<name>` event
//! produced by a correlated reply or a stream push.
//!
//! # Example
//!
//! ```
//! use xapi_ws::listeners::{command_key, Listeners};
//!
//! let listeners: Listeners<String> = Listeners::new();
//! let handle = listeners.on(command_key("getVersion"), |payload| {
//!     println!("version reply: {payload}");
//! });
//!
//! assert_eq!(listeners.emit(&command_key("getVersion"), &"2.5.0".to_string()), 1);
//! handle.unsubscribe();
//! assert_eq!(listeners.emit(&command_key("getVersion"), &"2.5.0".to_string()), 0);
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A connection was admitted to the pool
pub const OPEN_EVENT: &str = "open";
/// A connection left the pool
pub const CLOSE_EVENT: &str = "close";
/// An inbound frame could not be decoded or correlated
pub const PROTOCOL_ERROR_EVENT: &str = "protocol_error";

/// Event name for replies and pushes of one command
pub fn command_key(command: &str) -> String {
    format!("command_{command}")
}

/// Listener callback
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

type ListenerMap<T> = HashMap<String, Vec<(u64, Listener<T>)>>;

/// Named publish/subscribe registry
///
/// Callbacks run synchronously on the emitting task; keep them short and
/// hand real work to a spawned task.
pub struct Listeners<T> {
    inner: Arc<RwLock<ListenerMap<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a callback for `event`
    ///
    /// The callback stays registered until [`ListenerHandle::unsubscribe`]
    /// is called; dropping the handle leaves it in place.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let registry: Weak<RwLock<ListenerMap<T>>> = Arc::downgrade(&self.inner);
        ListenerHandle {
            event: event.clone(),
            remove: Box::new(move || {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let mut map = registry.write();
                if let Some(list) = map.get_mut(&event) {
                    list.retain(|(lid, _)| *lid != id);
                    if list.is_empty() {
                        map.remove(&event);
                    }
                }
            }),
        }
    }

    /// Call every callback registered for `event`; returns how many ran
    pub fn emit(&self, event: &str, payload: &T) -> usize {
        // Snapshot so callbacks may register or remove listeners
        let callbacks: Vec<Listener<T>> = match self.inner.read().get(event) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    /// Number of callbacks registered for `event`
    pub fn count(&self, event: &str) -> usize {
        self.inner.read().get(event).map_or(0, Vec::len)
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.read();
        let mut events: Vec<(&String, usize)> = map.iter().map(|(k, v)| (k, v.len())).collect();
        events.sort();
        f.debug_struct("Listeners").field("events", &events).finish()
    }
}

/// Registration returned by [`Listeners::on`]
pub struct ListenerHandle {
    event: String,
    remove: Box<dyn FnOnce() + Send + Sync>,
}

impl ListenerHandle {
    /// Event the callback is registered for
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the callback
    pub fn unsubscribe(self) {
        (self.remove)();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("event", &self.event).finish()
    }
}
