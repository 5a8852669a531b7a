//! Session lifecycle events and the observer list that fans them out.
//!
//! Dispatch is synchronous and follows registration order. The listener list
//! is snapshotted before dispatch, so a listener may register or remove
//! listeners (or call back into the session) without deadlocking. A panicking
//! listener is logged and the remaining listeners still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use super::subscription::SubscriptionId;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` or `reconnect()` was called.
    Requested,
    /// The broker or the network closed the connection.
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    ConnectionClosed,
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        servers: Vec<String>,
    },
    /// The connection is going away. Emitted before any subscription is
    /// released or the transport is closed.
    Disconnecting {
        reason: DisconnectReason,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    Subscribed {
        topic: String,
        subscription_id: SubscriptionId,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    Published {
        topic: String,
        bytes: usize,
    },
    Message {
        topic: String,
        subscription_id: SubscriptionId,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Disconnecting { .. } => "disconnecting",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Reconnecting { .. } => "reconnecting",
            SessionEvent::Subscribed { .. } => "subscribed",
            SessionEvent::Unsubscribed { .. } => "unsubscribed",
            SessionEvent::Published { .. } => "published",
            SessionEvent::Message { .. } => "message",
        }
    }
}

pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &SessionEvent) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("Error in event listener for {}", event.name());
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}
