//! In-process broker
//!
//! `MemoryBroker` keeps topics, their subscriber sets and the connected
//! clients in one map behind a lock, the same shape a popsub broker uses on
//! the server side. Every `MemoryTransport` created from it dials into that
//! shared state, so several sessions can talk to each other without a socket.
//!
//! It also exposes the hooks tests need: injecting frames from "another
//! client", rejecting the next connect, requiring credentials, delaying
//! connects, and dropping every connection as if the broker went away.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{BrokerTransport, CloseReason, Frame, FrameSubscription, TransportHandle, TransportSid};
use crate::cards::BoundedHistory;
use crate::config::{AuthType, ConnectionConfig};
use crate::utils::{TransportError, lock};

type ClientId = u64;
type SubscriberKey = (ClientId, TransportSid);

#[derive(Debug, Default)]
struct Topic {
    subscribers: HashSet<SubscriberKey>,
}

#[derive(Debug)]
struct ClientEntry {
    routes: HashMap<TransportSid, mpsc::UnboundedSender<Frame>>,
    next_sid: TransportSid,
    closed_tx: watch::Sender<Option<CloseReason>>,
}

/// Frames kept for [`MemoryBroker::published`].
pub const PUBLISHED_HISTORY: usize = 1000;

#[derive(Debug)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    clients: HashMap<ClientId, ClientEntry>,
    next_client: ClientId,
    reject_next: Option<String>,
    credentials: Option<(String, String)>,
    connect_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    published: BoundedHistory<Frame>,
    connects: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            clients: HashMap::new(),
            next_client: 0,
            reject_next: None,
            credentials: None,
            connect_delay: None,
            subscribe_delay: None,
            published: BoundedHistory::new(PUBLISHED_HISTORY),
            connects: 0,
        }
    }
}

impl BrokerState {
    fn fan_out(&mut self, frame: &Frame) {
        self.published.push(frame.clone());

        let Some(topic) = self.topics.get(&frame.subject) else {
            debug!("Topic '{}' has no subscribers", frame.subject);
            return;
        };
        for (client_id, sid) in &topic.subscribers {
            if let Some(sender) = self
                .clients
                .get(client_id)
                .and_then(|client| client.routes.get(sid))
            {
                let _ = sender.send(frame.clone());
            }
        }
    }

    fn cleanup_client(&mut self, client_id: ClientId) -> Option<ClientEntry> {
        let client = self.clients.remove(&client_id)?;
        for topic in self.topics.values_mut() {
            topic.subscribers.retain(|(owner, _)| *owner != client_id);
        }
        self.topics.retain(|_, topic| !topic.subscribers.is_empty());
        Some(client)
    }
}

/// Shared in-process broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            broker: self.clone(),
        })
    }

    /// Publishes as if another client had sent the frame.
    pub fn publish(&self, subject: &str, data: impl Into<Vec<u8>>) {
        lock(&self.state).fan_out(&Frame::new(subject, data));
    }

    /// Only accept `userpass` connections with these credentials.
    pub fn require_credentials(&self, username: &str, password: &str) {
        lock(&self.state).credentials = Some((username.to_string(), password.to_string()));
    }

    pub fn fail_next_connect(&self, reason: &str) {
        lock(&self.state).reject_next = Some(reason.to_string());
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        lock(&self.state).connect_delay = delay;
    }

    /// Holds every subscribe for `delay` before the broker registers it.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        lock(&self.state).subscribe_delay = delay;
    }

    /// Closes every client connection from the broker side.
    pub fn drop_connections(&self, error: Option<&str>) {
        let clients: Vec<ClientEntry> = {
            let mut state = lock(&self.state);
            let ids: Vec<ClientId> = state.clients.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.cleanup_client(id))
                .collect()
        };
        for client in clients {
            client.closed_tx.send_replace(Some(CloseReason {
                error: error.map(str::to_string),
            }));
        }
    }

    /// The last [`PUBLISHED_HISTORY`] frames published by any client,
    /// oldest first.
    pub fn published(&self) -> Vec<Frame> {
        lock(&self.state).published.latest(0)
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        lock(&self.state)
            .topics
            .get(subject)
            .map_or(0, |topic| topic.subscribers.len())
    }

    pub fn client_count(&self) -> usize {
        lock(&self.state).clients.len()
    }

    /// Successful connects since the broker was created.
    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        let delay = lock(&self.broker.state).connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.broker.state);
        if let Some(reason) = state.reject_next.take() {
            return Err(TransportError::Connect {
                server: config.servers.first().cloned().unwrap_or_default(),
                reason,
            });
        }
        if let Some((username, password)) = &state.credentials {
            let accepted = config.auth_type == AuthType::Userpass
                && config.username == *username
                && config.password == *password;
            if !accepted {
                return Err(TransportError::Rejected("invalid credentials".into()));
            }
        }

        state.next_client += 1;
        state.connects += 1;
        let client_id = state.next_client;
        let (closed_tx, _) = watch::channel(None);
        state.clients.insert(
            client_id,
            ClientEntry {
                routes: HashMap::new(),
                next_sid: 0,
                closed_tx,
            },
        );

        Ok(Arc::new(MemoryHandle {
            broker: self.broker.clone(),
            client_id,
        }))
    }
}

struct MemoryHandle {
    broker: MemoryBroker,
    client_id: ClientId,
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let mut state = lock(&self.broker.state);
        if !state.clients.contains_key(&self.client_id) {
            return Err(TransportError::Closed);
        }
        state.fan_out(&Frame::new(subject, data));
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<FrameSubscription, TransportError> {
        let delay = lock(&self.broker.state).subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.broker.state);
        let client = state
            .clients
            .get_mut(&self.client_id)
            .ok_or(TransportError::Closed)?;

        let (tx, frames) = mpsc::unbounded_channel();
        client.next_sid += 1;
        let sid = client.next_sid;
        client.routes.insert(sid, tx);

        state
            .topics
            .entry(subject.to_string())
            .or_default()
            .subscribers
            .insert((self.client_id, sid));

        Ok(FrameSubscription { sid, frames })
    }

    async fn unsubscribe(&self, sid: TransportSid) -> Result<(), TransportError> {
        let mut state = lock(&self.broker.state);
        if let Some(client) = state.clients.get_mut(&self.client_id) {
            client.routes.remove(&sid);
        }
        for topic in state.topics.values_mut() {
            topic.subscribers.remove(&(self.client_id, sid));
        }
        state.topics.retain(|_, topic| !topic.subscribers.is_empty());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let client = lock(&self.broker.state).cleanup_client(self.client_id);
        if let Some(client) = client {
            client.closed_tx.send_replace(Some(CloseReason::default()));
        }
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        let state = lock(&self.broker.state);
        match state.clients.get(&self.client_id) {
            Some(client) => client.closed_tx.subscribe(),
            None => watch::channel(Some(CloseReason::default())).1,
        }
    }
}
