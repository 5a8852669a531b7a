use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use super::*;
use crate::broker::{BrokerSession, Message, Payload};
use crate::config::{ConnectionConfig, ConnectionOptions};
use crate::transport::MemoryBroker;
use crate::utils::BrokerError;

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(CardId, Message)>>,
    lost: Mutex<Vec<Vec<CardId>>>,
    restored: Mutex<usize>,
}

impl RecordingSink {
    fn delivered_to(&self, card_id: &str) -> Vec<Message> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| owner == card_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl CardSink for RecordingSink {
    fn deliver(&self, card_id: &str, message: Message) {
        self.delivered
            .lock()
            .unwrap()
            .push((card_id.to_string(), message));
    }

    fn connection_lost(&self, card_ids: &[CardId]) {
        self.lost.lock().unwrap().push(card_ids.to_vec());
    }

    fn connection_restored(&self) {
        *self.restored.lock().unwrap() += 1;
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new(["ws://localhost:8080"]).with_options(ConnectionOptions {
        auto_reconnect: false,
        ..ConnectionOptions::default()
    })
}

async fn setup() -> (MemoryBroker, BrokerSession, Arc<RecordingSink>, Multiplexer) {
    let broker = MemoryBroker::new();
    let session = BrokerSession::new(broker.transport());
    session.connect(config()).await.unwrap();
    let sink = Arc::new(RecordingSink::default());
    let mux = Multiplexer::new(session.clone(), sink.clone());
    (broker, session, sink, mux)
}

async fn wait_for(sink: &RecordingSink, card_id: &str, count: usize) {
    timeout(Duration::from_secs(1), async {
        while sink.delivered_to(card_id).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deliveries timed out");
}

#[tokio::test]
async fn test_bind_routes_to_owner() {
    let (broker, _session, sink, mux) = setup().await;

    let id = mux.bind("c1", "a").await.unwrap();
    mux.bind("c2", "b").await.unwrap();
    broker.publish("a", "for c1");
    broker.publish("b", "for c2");

    wait_for(&sink, "c1", 1).await;
    wait_for(&sink, "c2", 1).await;
    let c1 = sink.delivered_to("c1");
    assert_eq!(c1[0].payload, Payload::from("for c1"));
    assert_eq!(c1[0].subscription_id, Some(id));
    assert!(mux.is_bound("c1"));
    assert_eq!(mux.bound_cards(), vec!["c1", "c2"]);
    assert_eq!(mux.len(), 2);
}

#[tokio::test]
async fn test_rebind_replaces_previous_subscription() {
    let (broker, session, sink, mux) = setup().await;

    let first = mux.bind("c1", "a").await.unwrap();
    let second = mux.bind("c1", "b").await.unwrap();

    assert_ne!(first, second);
    assert_eq!(session.subscription_count(), 1);
    assert_eq!(broker.subscriber_count("a"), 0);
    assert_eq!(mux.binding("c1").unwrap().topic, "b");

    broker.publish("a", "stale");
    broker.publish("b", "fresh");
    wait_for(&sink, "c1", 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let delivered = sink.delivered_to("c1");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, Payload::from("fresh"));
}

#[tokio::test]
async fn test_unbind_stops_delivery() {
    let (broker, session, sink, mux) = setup().await;
    mux.bind("c1", "a").await.unwrap();

    assert!(mux.unbind("c1").await.is_some());
    assert!(mux.unbind("c1").await.is_none());
    broker.publish("a", "late");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(sink.delivered_to("c1").is_empty());
    assert!(!mux.is_bound("c1"));
    assert_eq!(session.subscription_count(), 0);
}

#[tokio::test]
async fn test_bind_failure_leaves_no_binding() {
    let (_broker, _session, _sink, mux) = setup().await;

    let err = mux.bind("c1", "bad topic").await.unwrap_err();

    assert!(matches!(err, BrokerError::InvalidTopic(_)));
    assert!(mux.binding("c1").is_none());
}

#[tokio::test]
async fn test_bind_requires_connection() {
    let broker = MemoryBroker::new();
    let session = BrokerSession::new(broker.transport());
    let mux = Multiplexer::new(session, Arc::new(RecordingSink::default()));

    assert_eq!(mux.bind("c1", "a").await, Err(BrokerError::NotConnected));
    assert!(mux.is_empty());
}

#[tokio::test]
async fn test_disconnect_releases_all_bindings() {
    let (_broker, session, sink, mux) = setup().await;
    mux.bind("c2", "b").await.unwrap();
    mux.bind("c1", "a").await.unwrap();

    session.disconnect().await;

    assert!(mux.is_empty());
    assert!(mux.bound_cards().is_empty());
    assert_eq!(*sink.lost.lock().unwrap(), vec![vec!["c1".to_string(), "c2".to_string()]]);
}

#[tokio::test]
async fn test_broker_close_releases_bindings_and_reconnect_restores() {
    let (broker, session, sink, mux) = setup().await;
    mux.bind("c1", "a").await.unwrap();

    broker.drop_connections(Some("gone"));
    timeout(Duration::from_secs(1), async {
        while !mux.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sink.lost.lock().unwrap().len(), 1);

    session.reconnect().await.unwrap();
    assert_eq!(*sink.restored.lock().unwrap(), 1);
    assert!(!mux.is_bound("c1"));
}

#[tokio::test]
async fn test_with_binding_sees_pending_and_live_state() {
    let (_broker, _session, _sink, mux) = setup().await;
    let id = mux.bind("c1", "a").await.unwrap();

    let live = mux.with_binding("c1", |binding| {
        binding.is_some_and(|b| b.live && b.subscription_id == id)
    });
    assert!(live);
    assert!(mux.with_binding("missing", |binding| binding.is_none()));
}

#[tokio::test]
async fn test_dropping_mux_removes_listener() {
    let (_broker, session, sink, mux) = setup().await;
    mux.bind("c1", "a").await.unwrap();
    drop(mux);

    session.disconnect().await;
    assert!(sink.lost.lock().unwrap().is_empty());
}
