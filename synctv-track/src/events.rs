//! In-process typed publish/subscribe
//!
//! An [`EventChannel`] keeps, per event kind, an ordered list of handlers.
//! Publishing snapshots the matching handlers, drops one-shot entries, and
//! releases the lock before invoking anything, so handlers are free to
//! subscribe, unsubscribe, or call back into the object that owns the channel.

use crate::types::TrackId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An event that can travel through an [`EventChannel`]
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Shared event handler. Identity (for removal) is the `Arc` allocation.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Wrap a closure into a [`Handler`]
pub fn handler<E, F>(f: F) -> Handler<E>
where
    F: Fn(&E) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle returned by [`EventChannel::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener<E: Event> {
    id: ListenerId,
    kind: E::Kind,
    once: bool,
    handler: Handler<E>,
}

pub struct EventChannel<E: Event> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl<E: Event> EventChannel<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler invoked on every event of `kind`
    pub fn subscribe(&self, kind: E::Kind, handler: Handler<E>) -> ListenerId {
        self.insert(kind, handler, false)
    }

    /// Register a handler invoked on the next event of `kind` only
    pub fn subscribe_once(&self, kind: E::Kind, handler: Handler<E>) -> ListenerId {
        self.insert(kind, handler, true)
    }

    fn insert(&self, kind: E::Kind, handler: Handler<E>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener {
            id,
            kind,
            once,
            handler,
        });
        id
    }

    /// Remove a listener by handle. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Remove the first registration of exactly this handler for `kind`
    pub fn remove_handler(&self, kind: E::Kind, handler: &Handler<E>) -> bool {
        let mut listeners = self.listeners.lock();
        let position = listeners
            .iter()
            .position(|l| l.kind == kind && same_handler(&l.handler, handler));
        match position {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to its subscribers in registration order.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler<E>> = {
            let mut listeners = self.listeners.lock();
            let matching = listeners
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| Arc::clone(&l.handler))
                .collect();
            listeners.retain(|l| !(l.once && l.kind == kind));
            matching
        };

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    #[must_use]
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners.lock().iter().filter(|l| l.kind == kind).count()
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

fn same_handler<E>(a: &Handler<E>, b: &Handler<E>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Kinds of notification published by an outgoing track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackEventKind {
    Remb,
    Muted,
    Stopped,
}

/// Notification published by an outgoing track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackEvent {
    /// Receiver bandwidth estimate relayed from the forwarding engine (bps)
    Remb { track: TrackId, bitrate: u64 },
    /// The track's muted flag changed
    Muted { muted: bool },
    /// The track reached its terminal state
    Stopped { track: TrackId },
}

impl Event for TrackEvent {
    type Kind = TrackEventKind;

    fn kind(&self) -> TrackEventKind {
        match self {
            Self::Remb { .. } => TrackEventKind::Remb,
            Self::Muted { .. } => TrackEventKind::Muted,
            Self::Stopped { .. } => TrackEventKind::Stopped,
        }
    }
}

/// Kinds of notification published by a forwarding link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEventKind {
    Stopped,
}

/// Notification published by a forwarding link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link terminated, either on request or on its own
    Stopped,
}

impl Event for LinkEvent {
    type Kind = LinkEventKind;

    fn kind(&self) -> LinkEventKind {
        match self {
            Self::Stopped => LinkEventKind::Stopped,
        }
    }
}
