//! In-process event bus.
//!
//! Components publish [`CoreEvent`]s; UI observers and sibling components
//! subscribe per [`EventKind`]. Subscriptions are scoped: each handle must be
//! released explicitly, and dropping it releases it as well, so a torn-down
//! observer can never be invoked again.

use crate::models::{
    CallSession, CallerMeta, ConnectionState, InboundMessage, OutboundMessage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Everything observable about the realtime core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ConnectionChanged(ConnectionState),
    /// An optimistic outbound entry was appended to the conversation.
    MessageAppended(OutboundMessage),
    /// An existing outbound entry changed delivery state.
    MessageUpdated(OutboundMessage),
    MessageReceived(InboundMessage),
    TypingChanged {
        user_id: String,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: String,
        online: bool,
    },
    CallChanged(CallSession),
    IncomingCall {
        session: CallSession,
        caller_meta: CallerMeta,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionChanged,
    MessageAppended,
    MessageUpdated,
    MessageReceived,
    TypingChanged,
    PresenceChanged,
    CallChanged,
    IncomingCall,
}

impl CoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionChanged(_) => EventKind::ConnectionChanged,
            Self::MessageAppended(_) => EventKind::MessageAppended,
            Self::MessageUpdated(_) => EventKind::MessageUpdated,
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::TypingChanged { .. } => EventKind::TypingChanged,
            Self::PresenceChanged { .. } => EventKind::PresenceChanged,
            Self::CallChanged(_) => EventKind::CallChanged,
            Self::IncomingCall { .. } => EventKind::IncomingCall,
        }
    }
}

type Handler = Arc<dyn Fn(&CoreEvent) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// Typed publish/subscribe bus keyed by event kind.
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for one event kind. The returned handle owns the
    /// registration; releasing (or dropping) it unregisters the handler.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> BusSubscription
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        BusSubscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Deliver an event to every live subscriber of its kind. Handlers run
    /// outside the registry lock, so they may subscribe or release freely.
    pub fn publish(&self, event: &CoreEvent) {
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock();
            registry
                .handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            handler(event);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .handlers
            .get(&kind)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle owning one bus registration.
pub struct BusSubscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl BusSubscription {
    /// Unregister the handler now.
    pub fn release(self) {
        // Drop does the work.
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock();
            if let Some(list) = registry.handlers.get_mut(&self.kind) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    registry.handlers.remove(&self.kind);
                }
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.unregister();
    }
}
