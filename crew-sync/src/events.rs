//! Typed publish-subscribe with scoped subscription handles.
//!
//! [`Subscribers<T>`] is the building block: `subscribe` returns a
//! [`Subscription`] that detaches its handler when dropped, so a handler can
//! never outlive the component that registered it. [`EventBus`] routes
//! [`ChannelEvent`]s to per-[`EventKind`] subscriber lists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::connection::ConnectionError;
use crate::protocol::WireMessage;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HandlerList<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// A list of handlers for values of type `T`.
pub struct Subscribers<T> {
    inner: Arc<Mutex<HandlerList<T>>>,
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandlerList {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered while the returned
    /// [`Subscription`] is alive.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = list.next_id;
            list.next_id += 1;
            list.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<HandlerList<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut list = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    list.handlers.retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// Deliver `value` to every registered handler exactly once.
    ///
    /// Handlers are invoked outside the lock, so a handler may subscribe or
    /// drop subscriptions without deadlocking. Returns the number of
    /// handlers invoked.
    pub fn publish(&self, value: &T) -> usize {
        let snapshot: Vec<Handler<T>> = {
            let list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            list.handlers.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in &snapshot {
            handler(value);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the handler"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel events
// ───────────────────────────────────────────────────────────────────

/// Everything the connection manager can deliver to consumers.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Link established.
    Connect,
    /// Link lost or closed.
    Disconnect { reason: String },
    /// A connection attempt failed (1-based attempt counter).
    ConnectError { attempt: u32, error: ConnectionError },
    /// All reconnection attempts exhausted; the manager stays in `Error`.
    ReconnectFailed { attempts: u32 },
    /// A decoded inbound frame.
    Message(WireMessage),
}

/// Subscription key for [`ChannelEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    ReconnectFailed,
    Hello,
    Snapshot,
    EntityUpdate,
    EntityUpdated,
    UserJoined,
    UserLeft,
    PresenceUpdate,
    ActivityUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::ConnectError,
        EventKind::ReconnectFailed,
        EventKind::Hello,
        EventKind::Snapshot,
        EventKind::EntityUpdate,
        EventKind::EntityUpdated,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::PresenceUpdate,
        EventKind::ActivityUpdate,
    ];
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connect => EventKind::Connect,
            ChannelEvent::Disconnect { .. } => EventKind::Disconnect,
            ChannelEvent::ConnectError { .. } => EventKind::ConnectError,
            ChannelEvent::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            ChannelEvent::Message(msg) => match msg {
                WireMessage::Hello { .. } => EventKind::Hello,
                WireMessage::Snapshot { .. } => EventKind::Snapshot,
                WireMessage::EntityUpdate { .. } => EventKind::EntityUpdate,
                WireMessage::EntityUpdated { .. } => EventKind::EntityUpdated,
                WireMessage::UserJoined { .. } => EventKind::UserJoined,
                WireMessage::UserLeft { .. } => EventKind::UserLeft,
                WireMessage::PresenceUpdate { .. } => EventKind::PresenceUpdate,
                WireMessage::ActivityUpdate { .. } => EventKind::ActivityUpdate,
            },
        }
    }
}

/// Routes channel events to handlers registered per [`EventKind`].
pub struct EventBus {
    routes: HashMap<EventKind, Subscribers<ChannelEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            routes: EventKind::ALL
                .iter()
                .map(|kind| (*kind, Subscribers::new()))
                .collect(),
        }
    }

    /// Subscribe to one kind of event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.routes[&kind].subscribe(handler)
    }

    /// Unsubscribe a handler previously registered with [`on`](Self::on).
    pub fn off(&self, subscription: Subscription) {
        subscription.unsubscribe();
    }

    /// Deliver an event to the handlers of its kind.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        self.routes[&event.kind()].publish(event)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.routes[&kind].len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
