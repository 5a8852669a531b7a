use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::session::MessageHandler;
use crate::broker::{BrokerSession, Delivery, ErrorKind, ListenerId, Message, SessionEvent, SubscriptionId};
use crate::utils::error::Result;
use crate::utils::{BrokerError, lock};

pub type CardId = String;

/// One card's claim on a session subscription.
///
/// A binding is pending (`live == false`) from the moment `bind` allocates
/// the subscription id until the session confirms the subscription. Frames
/// that arrive while pending are still routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub subscription_id: SubscriptionId,
    pub topic: String,
    pub bound_at: DateTime<Utc>,
    pub live: bool,
}

/// Receives routed traffic and connection changes on behalf of the cards.
///
/// Called with the binding table locked: implementations must not call back
/// into the multiplexer.
pub trait CardSink: Send + Sync + 'static {
    fn deliver(&self, card_id: &str, message: Message);

    /// `card_ids` lost their bindings together, sorted.
    fn connection_lost(&self, card_ids: &[CardId]);

    fn connection_restored(&self);
}

struct Routes {
    bindings: Mutex<HashMap<CardId, Binding>>,
    sink: Arc<dyn CardSink>,
}

impl Routes {
    fn route(&self, card_id: &str, delivery: Delivery) {
        let bindings = lock(&self.bindings);
        match bindings.get(card_id) {
            Some(binding) if binding.subscription_id == delivery.subscription_id => {
                self.sink.deliver(card_id, Message::from(delivery));
            }
            _ => debug!("Dropping late delivery for card {card_id}"),
        }
    }

    fn invalidate_all(&self) {
        let mut bindings = lock(&self.bindings);
        if bindings.is_empty() {
            return;
        }
        let mut cards: Vec<CardId> = bindings.drain().map(|(card_id, _)| card_id).collect();
        cards.sort();
        warn!("Connection lost, releasing {} card bindings", cards.len());
        self.sink.connection_lost(&cards);
    }
}

/// Maps cards onto session subscriptions, at most one per card.
pub struct Multiplexer {
    session: BrokerSession,
    routes: Arc<Routes>,
    listener: ListenerId,
}

impl Multiplexer {
    pub fn new(session: BrokerSession, sink: Arc<dyn CardSink>) -> Self {
        let routes = Arc::new(Routes {
            bindings: Mutex::new(HashMap::new()),
            sink,
        });

        let weak = Arc::downgrade(&routes);
        let listener = session.add_listener(move |event| {
            let Some(routes) = weak.upgrade() else {
                return;
            };
            match event {
                SessionEvent::Disconnecting { .. }
                | SessionEvent::Disconnected { .. }
                | SessionEvent::Error {
                    kind: ErrorKind::Connection | ErrorKind::ConnectionClosed,
                    ..
                } => routes.invalidate_all(),
                SessionEvent::Connected { .. } => routes.sink.connection_restored(),
                _ => {}
            }
        });

        Self {
            session,
            routes,
            listener,
        }
    }

    pub fn session(&self) -> &BrokerSession {
        &self.session
    }

    /// Subscribes `card_id` to `topic`, replacing any binding it had.
    pub async fn bind(&self, card_id: &str, topic: &str) -> Result<SubscriptionId> {
        self.unbind(card_id).await;

        let id = SubscriptionId::generate();
        lock(&self.routes.bindings).insert(
            card_id.to_string(),
            Binding {
                subscription_id: id.clone(),
                topic: topic.to_string(),
                bound_at: Utc::now(),
                live: false,
            },
        );

        let routes = Arc::downgrade(&self.routes);
        let owner = card_id.to_string();
        let handler: MessageHandler = Arc::new(move |delivery| {
            if let Some(routes) = routes.upgrade() {
                routes.route(&owner, delivery);
            }
        });

        if let Err(e) = self
            .session
            .subscribe_with_id(id.clone(), topic, handler)
            .await
        {
            let released = {
                let mut bindings = lock(&self.routes.bindings);
                match bindings.get(card_id) {
                    Some(binding) if binding.subscription_id == id => {
                        bindings.remove(card_id);
                        false
                    }
                    Some(_) => false,
                    None => true,
                }
            };
            // The pending binding was drained by a connection loss.
            if released && e == BrokerError::NotConnected {
                return Err(BrokerError::ConnectionLost);
            }
            return Err(e);
        }

        let confirmed = {
            let mut bindings = lock(&self.routes.bindings);
            match bindings.get_mut(card_id) {
                Some(binding) if binding.subscription_id == id => {
                    binding.live = true;
                    Ok(())
                }
                Some(_) => Err(BrokerError::SubscriptionNotFound(id.to_string())),
                None if self.session.is_connected() => {
                    Err(BrokerError::SubscriptionNotFound(id.to_string()))
                }
                None => Err(BrokerError::ConnectionLost),
            }
        };
        if let Err(e) = confirmed {
            debug!("Binding for card {card_id} was released while subscribing");
            self.session.unsubscribe(&id).await;
            return Err(e);
        }

        info!("Bound card {card_id} to {topic} ({id})");
        Ok(id)
    }

    /// Releases `card_id`'s binding. Once this returns, no further message
    /// reaches the sink for that card.
    pub async fn unbind(&self, card_id: &str) -> Option<Binding> {
        let binding = lock(&self.routes.bindings).remove(card_id)?;
        self.session.unsubscribe(&binding.subscription_id).await;
        info!("Unbound card {card_id} from {}", binding.topic);
        Some(binding)
    }

    /// Runs `f` against `card_id`'s current binding with the binding table
    /// locked, so nothing can bind, unbind or route for any card meanwhile.
    pub fn with_binding<R>(&self, card_id: &str, f: impl FnOnce(Option<&Binding>) -> R) -> R {
        let bindings = lock(&self.routes.bindings);
        f(bindings.get(card_id))
    }

    pub fn is_bound(&self, card_id: &str) -> bool {
        self.with_binding(card_id, |binding| binding.is_some_and(|b| b.live))
    }

    pub fn binding(&self, card_id: &str) -> Option<Binding> {
        self.with_binding(card_id, |binding| binding.cloned())
    }

    /// Cards with a live binding, sorted.
    pub fn bound_cards(&self) -> Vec<CardId> {
        let mut cards: Vec<CardId> = lock(&self.routes.bindings)
            .iter()
            .filter(|(_, binding)| binding.live)
            .map(|(card_id, _)| card_id.clone())
            .collect();
        cards.sort();
        cards
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        lock(&self.routes.bindings)
            .values()
            .filter(|binding| binding.live)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.session.remove_listener(self.listener);
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("bound", &self.len())
            .finish()
    }
}
