//! Broker session
//!
//! `BrokerSession` owns the single physical connection to the broker:
//! - connect / disconnect / reconnect, with connects serialized by an
//!   in-flight flag (a second concurrent connect is rejected, not queued)
//! - raw publish and subscribe, one background delivery task per subscription
//! - lifecycle and error events through an ordered observer list
//! - recovery from broker-initiated closes, optionally retrying the last
//!   configuration in the background
//!
//! Concurrency notes:
//! - State lives behind one std mutex that is never held across an await and
//!   never held while listeners or message handlers run.
//! - Every connect and disconnect bumps a generation counter. Close
//!   notifications and in-flight subscribes carrying an older generation are
//!   discarded, so nothing outlives the connection it was created on.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{DisconnectReason, ErrorKind, EventBus, ListenerId, SessionEvent};
use super::message::Delivery;
use super::payload::Payload;
use super::subscription::{ActiveSubscription, SubscriptionId};
use crate::config::{ConnectionConfig, SessionSettings, sanitize, validate};
use crate::transport::{BrokerTransport, CloseReason, Frame, FrameSubscription, TransportHandle};
use crate::utils::error::Result;
use crate::utils::{BrokerError, lock};

pub type MessageHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Largest encoded body `publish` accepts.
    pub max_payload_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
        }
    }
}

impl From<&SessionSettings> for SessionOptions {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_payload_bytes: settings.max_payload_bytes,
        }
    }
}

/// Point-in-time view of the session for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub subscription_count: usize,
    /// Last-known configuration with credentials redacted.
    pub config: Option<ConnectionConfig>,
    pub reconnect_count: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_messages: u64,
}

#[derive(Default)]
struct SessionState {
    status: SessionStatus,
    handle: Option<Arc<dyn TransportHandle>>,
    config: Option<ConnectionConfig>,
    generation: u64,
    subscriptions: HashMap<SubscriptionId, ActiveSubscription>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    watcher: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

struct SessionInner {
    transport: Arc<dyn BrokerTransport>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    connecting: AtomicBool,
    events: EventBus,
    reconnect_count: AtomicU64,
    total_messages: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for subscription in state.subscriptions.values() {
            subscription.cancel();
        }
        if let Some(watcher) = state.watcher.take() {
            watcher.abort();
        }
        if let Some(supervisor) = state.supervisor.take() {
            supervisor.abort();
        }
        if let Some(handle) = state.handle.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = handle.close().await;
                });
            }
        }
    }
}

/// Clears the in-flight flag when a connect attempt ends, including when
/// the connecting future is dropped midway.
struct ConnectingGuard<'a>(&'a SessionInner);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        if state.status == SessionStatus::Connecting {
            state.status = SessionStatus::Disconnected;
        }
        drop(state);
        self.0.connecting.store(false, Ordering::SeqCst);
    }
}

/// Handle to the broker session. Clones share the same connection.
#[derive(Clone)]
pub struct BrokerSession {
    inner: Arc<SessionInner>,
}

impl BrokerSession {
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self::with_options(transport, SessionOptions::default())
    }

    pub fn with_options(transport: Arc<dyn BrokerTransport>, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                options,
                state: Mutex::new(SessionState::default()),
                connecting: AtomicBool::new(false),
                events: EventBus::default(),
                reconnect_count: AtomicU64::new(0),
                total_messages: AtomicU64::new(0),
            }),
        }
    }

    /// Connects with `config`, closing any existing connection first.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<()> {
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::AlreadyConnecting);
        }
        let _connecting = ConnectingGuard(&self.inner);

        let report = validate(&config);
        if !report.is_valid {
            warn!("Rejected connection config: {}", report.errors.join("; "));
            return Err(BrokerError::InvalidConfig(report.errors));
        }

        if self.teardown().await {
            info!("Was already connected, disconnected first");
        }

        lock(&self.inner.state).status = SessionStatus::Connecting;
        info!("Attempting connection {:?}", sanitize(&config));

        let handle = match self.inner.transport.connect(&config).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                {
                    let mut state = lock(&self.inner.state);
                    state.status = SessionStatus::Error;
                    state.last_error = Some(message.clone());
                }
                error!("Error in connect: {message}");
                self.inner.events.emit(&SessionEvent::Error {
                    kind: ErrorKind::Connection,
                    message: message.clone(),
                });
                return Err(BrokerError::ConnectFailed(message));
            }
        };

        {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.status = SessionStatus::Connected;
            state.config = Some(config.clone());
            state.connected_at = Some(Utc::now());
            state.last_error = None;
            state.watcher = Some(self.watch_close(&handle, state.generation));
            state.handle = Some(handle);
        }

        info!("Successfully connected to broker");
        self.inner.events.emit(&SessionEvent::Connected {
            servers: config.servers,
        });
        Ok(())
    }

    /// Closes the connection and every subscription on it. No-op when
    /// already disconnected. Also stops any background reconnect attempts.
    pub async fn disconnect(&self) {
        let supervisor = lock(&self.inner.state).supervisor.take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        if !self.teardown().await {
            debug!("disconnect() while not connected");
        }
    }

    /// Disconnects, then connects again with the last-known configuration.
    pub async fn reconnect(&self) -> Result<()> {
        let config = lock(&self.inner.state)
            .config
            .clone()
            .ok_or(BrokerError::NoPriorConfig)?;

        self.disconnect().await;
        self.inner.reconnect_count.fetch_add(1, Ordering::SeqCst);
        info!("Reconnecting to {}", config.servers.join(", "));
        self.connect(config).await
    }

    pub async fn publish(&self, topic: &str, payload: &Payload) -> Result<()> {
        let (handle, _) = self.connected_handle()?;
        validate_topic(topic)?;

        let body = payload.encode();
        let bytes = body.len();
        if bytes > self.inner.options.max_payload_bytes {
            return Err(BrokerError::InvalidPayload(format!(
                "{bytes} bytes exceeds the {} byte limit",
                self.inner.options.max_payload_bytes
            )));
        }

        if let Err(e) = handle.publish(topic, body.into_bytes()).await {
            let err = BrokerError::from(e);
            error!("Error in publish: {err}");
            self.inner.events.emit(&SessionEvent::Error {
                kind: ErrorKind::Publish,
                message: err.to_string(),
            });
            return Err(err);
        }

        debug!("Published to {topic} ({bytes} bytes)");
        self.inner.events.emit(&SessionEvent::Published {
            topic: topic.to_string(),
            bytes,
        });
        Ok(())
    }

    /// Subscribes to `topic`; `on_message` runs on the subscription's
    /// delivery task for every frame, in broker order.
    pub async fn subscribe<F>(&self, topic: &str, on_message: F) -> Result<SubscriptionId>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let id = SubscriptionId::generate();
        self.subscribe_with_id(id.clone(), topic, Arc::new(on_message))
            .await?;
        Ok(id)
    }

    /// Like [`subscribe`](Self::subscribe) for callers that allocate the id
    /// before the subscription exists.
    pub async fn subscribe_with_id(
        &self,
        id: SubscriptionId,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<()> {
        let (handle, generation) = self.connected_handle()?;
        validate_topic(topic)?;

        let FrameSubscription { sid, frames } = match handle.subscribe(topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let err = BrokerError::from(e);
                error!("Error in subscribe: {err}");
                self.inner.events.emit(&SessionEvent::Error {
                    kind: ErrorKind::Subscribe,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let (stale, replaced) = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation {
                (true, None)
            } else {
                let live = Arc::new(AtomicBool::new(true));
                let task = tokio::spawn(deliver_frames(
                    Arc::downgrade(&self.inner),
                    id.clone(),
                    frames,
                    on_message,
                    live.clone(),
                ));
                let active = ActiveSubscription::new(topic.to_string(), sid, live, task);
                (false, state.subscriptions.insert(id.clone(), active))
            }
        };

        if stale {
            let _ = handle.unsubscribe(sid).await;
            return Err(BrokerError::ConnectionLost);
        }
        if let Some(replaced) = replaced {
            replaced.cancel();
            let _ = handle.unsubscribe(replaced.sid).await;
        }

        info!("Subscribed to {topic} ({id})");
        self.inner.events.emit(&SessionEvent::Subscribed {
            topic: topic.to_string(),
            subscription_id: id,
        });
        Ok(())
    }

    /// Returns whether a subscription was removed. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let (subscription, handle) = {
            let mut state = lock(&self.inner.state);
            (state.subscriptions.remove(id), state.handle.clone())
        };
        let Some(subscription) = subscription else {
            debug!("Subscription {id} not found");
            return false;
        };

        subscription.cancel();
        if let Some(handle) = handle {
            if let Err(e) = handle.unsubscribe(subscription.sid).await {
                warn!("Error unsubscribing {id}: {e}");
            }
        }

        info!("Unsubscribed {id} from {}", subscription.topic);
        self.inner.events.emit(&SessionEvent::Unsubscribed {
            subscription_id: id.clone(),
        });
        true
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.state).subscriptions.len()
    }

    pub fn has_subscription(&self, id: &SubscriptionId) -> bool {
        lock(&self.inner.state).subscriptions.contains_key(id)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }

    /// Last-known configuration, credentials redacted.
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        lock(&self.inner.state).config.as_ref().map(sanitize)
    }

    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        self.inner.transport.clone()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = lock(&self.inner.state);
        SessionSnapshot {
            status: state.status,
            subscription_count: state.subscriptions.len(),
            config: state.config.as_ref().map(sanitize),
            reconnect_count: self.inner.reconnect_count.load(Ordering::SeqCst),
            connected_at: state.connected_at,
            last_error: state.last_error.clone(),
            total_messages: self.inner.total_messages.load(Ordering::Relaxed),
        }
    }

    fn connected_handle(&self) -> Result<(Arc<dyn TransportHandle>, u64)> {
        let state = lock(&self.inner.state);
        match (&state.handle, state.status) {
            (Some(handle), SessionStatus::Connected) => Ok((handle.clone(), state.generation)),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Tears down the current connection on request. Returns false when
    /// there was nothing to tear down.
    async fn teardown(&self) -> bool {
        let (handle, subscriptions, watcher) = {
            let mut state = lock(&self.inner.state);
            let Some(handle) = state.handle.take() else {
                return false;
            };
            state.generation += 1;
            state.status = SessionStatus::Disconnected;
            state.connected_at = None;
            (
                handle,
                std::mem::take(&mut state.subscriptions),
                state.watcher.take(),
            )
        };

        info!("Disconnecting from broker");
        self.inner.events.emit(&SessionEvent::Disconnecting {
            reason: DisconnectReason::Requested,
        });
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        for (id, subscription) in &subscriptions {
            subscription.cancel();
            if let Err(e) = handle.unsubscribe(subscription.sid).await {
                warn!("Error unsubscribing {id}: {e}");
            }
            self.inner.events.emit(&SessionEvent::Unsubscribed {
                subscription_id: id.clone(),
            });
        }
        info!("Unsubscribed from {} subscriptions", subscriptions.len());

        if let Err(e) = handle.close().await {
            error!("Error in disconnect: {e}");
        }

        info!("Successfully disconnected");
        self.inner.events.emit(&SessionEvent::Disconnected {
            reason: DisconnectReason::Requested,
        });
        true
    }

    fn watch_close(&self, handle: &Arc<dyn TransportHandle>, generation: u64) -> JoinHandle<()> {
        let mut closed = handle.closed();
        let session = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let reason = loop {
                if let Some(reason) = closed.borrow_and_update().clone() {
                    break reason;
                }
                if closed.changed().await.is_err() {
                    break closed.borrow().clone().unwrap_or_default();
                }
            };
            if let Some(inner) = session.upgrade() {
                BrokerSession { inner }.handle_transport_closed(generation, reason);
            }
        })
    }

    fn handle_transport_closed(&self, generation: u64, reason: CloseReason) {
        let subscriptions = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation || state.handle.is_none() {
                return;
            }
            state.handle = None;
            state.generation += 1;
            state.status = if reason.error.is_some() {
                SessionStatus::Error
            } else {
                SessionStatus::Disconnected
            };
            state.last_error = Some(
                reason
                    .error
                    .clone()
                    .unwrap_or_else(|| BrokerError::ConnectionLost.to_string()),
            );
            state.connected_at = None;
            state.watcher = None;

            let retry = state
                .config
                .clone()
                .filter(|c| c.options.auto_reconnect && c.options.max_attempts > 0);
            if let Some(config) = retry {
                let supervisor = spawn_supervisor(Arc::downgrade(&self.inner), config);
                if let Some(previous) = state.supervisor.replace(supervisor) {
                    previous.abort();
                }
            }
            std::mem::take(&mut state.subscriptions)
        };

        self.inner.events.emit(&SessionEvent::Disconnecting {
            reason: DisconnectReason::ConnectionLost,
        });
        for subscription in subscriptions.values() {
            subscription.cancel();
        }
        warn!(
            "Connection closed by broker, {} subscriptions invalidated",
            subscriptions.len()
        );

        if let Some(message) = reason.error {
            self.inner.events.emit(&SessionEvent::Error {
                kind: ErrorKind::ConnectionClosed,
                message,
            });
        }
        self.inner.events.emit(&SessionEvent::Disconnected {
            reason: DisconnectReason::ConnectionLost,
        });
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Retries the last configuration after a broker-initiated close. The first
/// attempt waits one backoff period.
fn spawn_supervisor(session: Weak<SessionInner>, config: ConnectionConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_attempts = config.options.max_attempts;
        let backoff = Duration::from_millis(config.options.backoff_ms);

        for attempt in 1..=max_attempts {
            tokio::time::sleep(backoff).await;
            let Some(inner) = session.upgrade() else {
                return;
            };
            let session = BrokerSession { inner };
            if session.is_connected() {
                return;
            }

            info!("Reconnect attempt {attempt}/{max_attempts}");
            session.inner.events.emit(&SessionEvent::Reconnecting {
                attempt,
                max_attempts,
            });
            match session.connect(config.clone()).await {
                Ok(()) => {
                    session.inner.reconnect_count.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Err(BrokerError::AlreadyConnecting) => return,
                Err(e) => warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
        error!("Giving up after {max_attempts} reconnect attempts");
    })
}

/// Topics must be non-empty and contain no whitespace.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.chars().any(char::is_whitespace) {
        return Err(BrokerError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

async fn deliver_frames(
    session: Weak<SessionInner>,
    id: SubscriptionId,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    on_message: MessageHandler,
    live: Arc<AtomicBool>,
) {
    while let Some(frame) = frames.recv().await {
        if !live.load(Ordering::Acquire) {
            break;
        }
        let Some(inner) = session.upgrade() else {
            break;
        };

        let topic = frame.subject;
        let delivery = Delivery {
            subscription_id: id.clone(),
            topic: topic.clone(),
            payload: Payload::decode(&frame.data),
            timestamp: Utc::now(),
        };
        if catch_unwind(AssertUnwindSafe(|| on_message(delivery))).is_err() {
            error!("Message handler for {topic} panicked");
        }

        inner.total_messages.fetch_add(1, Ordering::Relaxed);
        inner.events.emit(&SessionEvent::Message {
            topic,
            subscription_id: id.clone(),
        });
    }
    debug!("Delivery loop for {id} finished");
}
