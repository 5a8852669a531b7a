//! Card state store
//!
//! `CardStore` is what the dashboard talks to. Every verb takes a card id,
//! returns a plain `bool` and records failures on the card itself, so the UI
//! only ever reads snapshots.
//!
//! Lock order: the multiplexer's binding table is always taken before the
//! card table, never the other way round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::history::BoundedHistory;
use super::state::{CardLimits, CardState, CardStatus, Metrics, PublishRecord};
use crate::broker::{BrokerSession, Message, Payload};
use crate::mux::{CardId, CardSink, Multiplexer};
use crate::utils::{BrokerError, lock};

/// Card type given to cards a verb creates implicitly.
pub const DEFAULT_CARD_TYPE: &str = "generic";

struct CardEntry {
    state: CardState,
    messages: BoundedHistory<Message>,
    publishes: BoundedHistory<PublishRecord>,
    metrics: Metrics,
    /// Publishes in flight.
    publishing: u32,
    /// Status to return to once the last in-flight publish finishes.
    resume_status: CardStatus,
}

impl CardEntry {
    fn new(card_id: &str, card_type: &str, limits: &CardLimits) -> Self {
        Self {
            state: CardState::new(card_id, card_type),
            messages: BoundedHistory::new(limits.message_history),
            publishes: BoundedHistory::new(limits.publish_history),
            metrics: Metrics::default(),
            publishing: 0,
            resume_status: CardStatus::Idle,
        }
    }

    /// Moves to `status`, or queues it behind an in-flight publish.
    fn transition(&mut self, status: CardStatus) {
        if self.publishing > 0 {
            self.resume_status = status;
        } else {
            self.state.status = status;
        }
    }

    fn record_error(&mut self, message: String) {
        self.metrics.error_count += 1;
        self.state.error = Some(message);
    }
}

/// Per-card state behind one lock. Also the multiplexer's sink.
pub(crate) struct CardTable {
    cards: Mutex<HashMap<CardId, CardEntry>>,
    limits: CardLimits,
}

impl CardTable {
    fn new(limits: CardLimits) -> Self {
        Self {
            cards: Mutex::new(HashMap::new()),
            limits,
        }
    }

    fn ensure(&self, card_id: &str) {
        lock(&self.cards)
            .entry(card_id.to_string())
            .or_insert_with(|| {
                debug!("Implicitly initializing card {card_id}");
                CardEntry::new(card_id, DEFAULT_CARD_TYPE, &self.limits)
            });
    }

    fn update<R>(&self, card_id: &str, f: impl FnOnce(&mut CardEntry) -> R) -> Option<R> {
        lock(&self.cards).get_mut(card_id).map(f)
    }

    fn read<R>(&self, card_id: &str, f: impl FnOnce(&CardEntry) -> R) -> Option<R> {
        lock(&self.cards).get(card_id).map(f)
    }
}

impl CardSink for CardTable {
    fn deliver(&self, card_id: &str, mut message: Message) {
        let mut cards = lock(&self.cards);
        let Some(entry) = cards.get_mut(card_id) else {
            debug!("Dropping message for unknown card {card_id}");
            return;
        };

        if let Some(last) = entry.messages.last() {
            if message.received_at < last.received_at {
                message.received_at = last.received_at;
            }
        }
        let at = message.received_at;
        entry.messages.push(message);

        entry.metrics.total_messages += 1;
        entry.metrics.last_message_time = Some(at);
        entry.metrics.messages_per_second =
            messages_per_second(&entry.messages, at, self.limits.rate_window);

        entry.state.last_activity = Some(at);
        if entry.state.status != CardStatus::Error {
            entry.state.error = None;
        }
    }

    fn connection_lost(&self, card_ids: &[CardId]) {
        let mut cards = lock(&self.cards);
        for card_id in card_ids {
            if let Some(entry) = cards.get_mut(card_id) {
                entry.transition(CardStatus::Disconnected);
                entry.state.error = Some(BrokerError::ConnectionLost.to_string());
            }
        }
    }

    fn connection_restored(&self) {
        let mut cards = lock(&self.cards);
        for entry in cards.values_mut() {
            if entry.resume_status == CardStatus::Disconnected {
                entry.resume_status = CardStatus::Idle;
            }
            if entry.state.status == CardStatus::Disconnected {
                entry.state.status = CardStatus::Idle;
                entry.state.error = None;
            }
        }
    }
}

/// Messages in the window `(at - window, at]`, per second.
fn messages_per_second(
    messages: &BoundedHistory<Message>,
    at: DateTime<Utc>,
    window: Duration,
) -> f64 {
    let Ok(span) = chrono::Duration::from_std(window) else {
        return 0.0;
    };
    if window.is_zero() {
        return 0.0;
    }
    let since = at - span;
    let recent = messages
        .iter()
        .rev()
        .take_while(|message| message.received_at > since)
        .count();
    recent as f64 / window.as_secs_f64()
}

/// Holds a card in `Publishing` for the duration of one publish. Dropping it,
/// including when the publish future is cancelled, puts back the status the
/// card had before.
struct PublishGuard<'a> {
    table: &'a CardTable,
    card_id: &'a str,
}

impl<'a> PublishGuard<'a> {
    fn begin(table: &'a CardTable, card_id: &'a str) -> Self {
        table.update(card_id, |entry| {
            if entry.publishing == 0 {
                entry.resume_status = entry.state.status;
            }
            entry.publishing += 1;
            entry.state.status = CardStatus::Publishing;
            entry.state.last_activity = Some(Utc::now());
        });
        Self { table, card_id }
    }
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.table.update(self.card_id, |entry| {
            entry.publishing = entry.publishing.saturating_sub(1);
            if entry.publishing == 0 && entry.state.status == CardStatus::Publishing {
                entry.state.status = entry.resume_status;
            }
        });
    }
}

/// The dashboard's card-facing command surface.
pub struct CardStore {
    mux: Multiplexer,
    table: Arc<CardTable>,
}

impl CardStore {
    pub fn new(session: BrokerSession) -> Self {
        Self::with_limits(session, CardLimits::default())
    }

    pub fn with_limits(session: BrokerSession, limits: CardLimits) -> Self {
        let table = Arc::new(CardTable::new(limits));
        Self {
            mux: Multiplexer::new(session, table.clone()),
            table,
        }
    }

    pub fn session(&self) -> &BrokerSession {
        self.mux.session()
    }

    pub fn limits(&self) -> &CardLimits {
        &self.table.limits
    }

    /// Creates `card_id`, or resets its history and metrics if it exists.
    /// A card that is still bound keeps its `Subscribed` status and topic.
    pub fn initialize_card(&self, card_id: &str, card_type: &str) {
        self.mux.with_binding(card_id, |binding| {
            let mut entry = CardEntry::new(card_id, card_type, &self.table.limits);
            if let Some(binding) = binding.filter(|b| b.live) {
                entry.state.status = CardStatus::Subscribed;
                entry.state.topic = Some(binding.topic.clone());
            }
            lock(&self.table.cards).insert(card_id.to_string(), entry);
        });
        info!("Initialized card {card_id} ({card_type})");
    }

    pub async fn subscribe_card(&self, card_id: &str, topic: &str) -> bool {
        self.table.ensure(card_id);
        if topic.trim().is_empty() {
            error!("Cannot subscribe card {card_id}: topic is required");
            self.table.update(card_id, |entry| {
                entry.record_error("Cannot subscribe: topic is required".to_string());
            });
            return false;
        }

        self.mux.unbind(card_id).await;
        self.table.update(card_id, |entry| {
            entry.transition(CardStatus::Subscribing);
            entry.state.topic = Some(topic.to_string());
        });

        let id = match self.mux.bind(card_id, topic).await {
            Ok(id) => id,
            Err(BrokerError::SubscriptionNotFound(_)) => {
                debug!("Subscribe for card {card_id} was superseded");
                return false;
            }
            Err(BrokerError::ConnectionLost) => {
                warn!("Connection lost while subscribing card {card_id}");
                let connected = self.mux.session().is_connected();
                self.table.update(card_id, |entry| {
                    if connected {
                        entry.transition(CardStatus::Idle);
                        entry.state.error = None;
                    } else {
                        entry.transition(CardStatus::Disconnected);
                        entry.state.error = Some(BrokerError::ConnectionLost.to_string());
                    }
                });
                return false;
            }
            Err(e) => {
                error!("Subscription failed for card {card_id}: {e}");
                self.table.update(card_id, |entry| {
                    entry.transition(CardStatus::Error);
                    entry.record_error(e.to_string());
                });
                return false;
            }
        };

        let applied = self.mux.with_binding(card_id, |binding| {
            if !binding.is_some_and(|b| b.live && b.subscription_id == id) {
                return Some(false);
            }
            self.table.update(card_id, |entry| {
                entry.transition(CardStatus::Subscribed);
                entry.state.error = None;
                entry.state.last_activity = Some(Utc::now());
                true
            })
        });

        match applied {
            Some(true) => {
                info!("Subscribed card {card_id} to topic: {topic}");
                true
            }
            Some(false) => {
                warn!("Binding for card {card_id} was released before it settled");
                false
            }
            None => {
                debug!("Card {card_id} was removed while subscribing");
                self.mux.unbind(card_id).await;
                false
            }
        }
    }

    /// Returns true once the card is unbound, including when it already was.
    pub async fn unsubscribe_card(&self, card_id: &str) -> bool {
        match self.mux.unbind(card_id).await {
            Some(_) => {
                self.table.update(card_id, |entry| {
                    entry.transition(CardStatus::Idle);
                    entry.state.last_activity = Some(Utc::now());
                });
                info!("Unsubscribed card: {card_id}");
            }
            None => debug!("Card {card_id} already unsubscribed"),
        }
        true
    }

    pub async fn publish_from_card(
        &self,
        card_id: &str,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> bool {
        let payload = payload.into();
        self.table.ensure(card_id);
        if topic.trim().is_empty() {
            error!("Cannot publish from card {card_id}: topic is required");
            self.table.update(card_id, |entry| {
                entry.record_error("Cannot publish: topic is required".to_string());
            });
            return false;
        }

        let guard = PublishGuard::begin(&self.table, card_id);
        let result = self.session().publish(topic, &payload).await;

        let success = result.is_ok();
        let record = PublishRecord {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
            success,
            error: result.err().map(|e| e.to_string()),
        };
        match &record.error {
            Some(e) => error!("Publish failed for card {card_id}: {e}"),
            None => info!("Published from card {card_id} to topic: {topic}"),
        }

        self.table.update(card_id, |entry| {
            if let Some(e) = &record.error {
                entry.record_error(e.clone());
            } else {
                entry.state.error = None;
            }
            entry.state.last_activity = Some(record.timestamp);
            entry.publishes.push(record);
        });
        drop(guard);
        success
    }

    /// Applies a delivered message to `card_id`. Unknown cards drop it.
    pub fn handle_delivery(&self, card_id: &str, message: Message) {
        self.table.deliver(card_id, message);
    }

    pub fn clear_card_messages(&self, card_id: &str) {
        self.table.update(card_id, |entry| {
            entry.messages.clear();
            entry.metrics.total_messages = 0;
            entry.metrics.messages_per_second = 0.0;
            entry.metrics.last_message_time = None;
        });
        info!("Cleared messages for card: {card_id}");
    }

    /// Unbinds `card_id` and forgets it. Unknown ids are a no-op.
    pub async fn cleanup_card(&self, card_id: &str) {
        self.mux.unbind(card_id).await;
        if lock(&self.table.cards).remove(card_id).is_some() {
            info!("Cleaned up card: {card_id}");
        }
    }

    pub fn get_card_state(&self, card_id: &str) -> Option<CardState> {
        self.table.read(card_id, |entry| entry.state.clone())
    }

    /// The newest `limit` messages, oldest first. `0` returns all of them.
    pub fn get_card_messages(&self, card_id: &str, limit: usize) -> Vec<Message> {
        self.table
            .read(card_id, |entry| entry.messages.latest(limit))
            .unwrap_or_default()
    }

    pub fn get_card_metrics(&self, card_id: &str) -> Option<Metrics> {
        self.table.read(card_id, |entry| entry.metrics.clone())
    }

    pub fn get_publish_history(&self, card_id: &str, limit: usize) -> Vec<PublishRecord> {
        self.table
            .read(card_id, |entry| entry.publishes.latest(limit))
            .unwrap_or_default()
    }

    pub fn is_card_subscribed(&self, card_id: &str) -> bool {
        self.mux.is_bound(card_id)
    }

    pub fn is_card_publishing(&self, card_id: &str) -> bool {
        self.table
            .read(card_id, |entry| entry.publishing > 0)
            .unwrap_or(false)
    }

    pub fn subscribed_cards(&self) -> Vec<CardId> {
        self.mux.bound_cards()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.mux.len()
    }

    /// Messages currently held across every card's history.
    pub fn total_messages(&self) -> usize {
        lock(&self.table.cards)
            .values()
            .map(|entry| entry.messages.len())
            .sum()
    }

    pub fn card_ids(&self) -> Vec<CardId> {
        let mut ids: Vec<CardId> = lock(&self.table.cards).keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for CardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardStore")
            .field("cards", &lock(&self.table.cards).len())
            .field("mux", &self.mux)
            .finish()
    }
}
