use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use tokio::time::timeout;

use crate::broker::{BrokerSession, Payload, SessionStatus};
use crate::cards::{CardStatus, CardStore};
use crate::config::{ConnectionConfig, ConnectionManager, ConnectionOptions, validate};
use crate::persistence::{KeyValueStore, MemoryStore, SledStore};
use crate::transport::MemoryBroker;

fn options(auto_reconnect: bool) -> ConnectionOptions {
    ConnectionOptions {
        auto_reconnect,
        max_attempts: 3,
        backoff_ms: 10,
        auto_reconnect_on_startup: true,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn integration_dashboard_end_to_end() {
    let broker = MemoryBroker::new();
    let session = BrokerSession::new(broker.transport());
    let manager = ConnectionManager::new(session.clone(), Arc::new(MemoryStore::new("popdash_")));
    let cards = CardStore::new(session.clone());

    let config = ConnectionConfig::new(["ws://x"])
        .named("Local")
        .with_options(options(false));
    manager.connect(config).await.unwrap();
    assert!(manager.info().can_disconnect);

    cards.initialize_card("c1", "chart");
    cards.initialize_card("c2", "publisher");
    assert!(cards.subscribe_card("c1", "a.b").await);
    assert_eq!(cards.get_card_state("c1").unwrap().status, CardStatus::Subscribed);

    broker.publish("a.b", r#"{"v":1}"#);
    eventually("first delivery", || cards.get_card_messages("c1", 1).len() == 1).await;
    let messages = cards.get_card_messages("c1", 1);
    assert_eq!(messages[0].payload, Payload::Structured(json!({"v": 1})));
    assert_eq!(messages[0].topic, "a.b");

    assert!(cards.publish_from_card("c2", "a.b", "plain text").await);
    eventually("published delivery", || cards.get_card_messages("c1", 0).len() == 2).await;
    assert_eq!(cards.get_card_messages("c1", 1)[0].payload, Payload::from("plain text"));
    assert!(cards.get_publish_history("c2", 0)[0].success);
    assert!(cards.get_card_messages("c2", 0).is_empty());

    assert_eq!(manager.profiles().len(), 1);
    assert_eq!(
        manager.documents().connection_config().unwrap().servers,
        vec!["ws://x".to_string()]
    );

    manager.disconnect().await;
    assert_eq!(cards.get_card_state("c1").unwrap().status, CardStatus::Disconnected);
    assert!(cards.subscribed_cards().is_empty());
    assert_eq!(broker.client_count(), 0);
}

#[tokio::test]
async fn integration_broker_restart_reconnects_and_cards_resubscribe() {
    let broker = MemoryBroker::new();
    let session = BrokerSession::new(broker.transport());
    let cards = CardStore::new(session.clone());
    session
        .connect(ConnectionConfig::new(["ws://x"]).with_options(options(true)))
        .await
        .unwrap();
    assert!(cards.subscribe_card("c1", "metrics").await);

    broker.drop_connections(Some("restart"));
    eventually("automatic reconnect", || session.reconnect_count() == 1).await;
    eventually("card reset", || {
        cards.get_card_state("c1").is_some_and(|state| state.status == CardStatus::Idle)
    })
    .await;
    assert_eq!(session.status(), SessionStatus::Connected);
    assert!(!cards.is_card_subscribed("c1"));

    assert!(cards.subscribe_card("c1", "metrics").await);
    broker.publish("metrics", "42");
    eventually("delivery after reconnect", || cards.get_card_messages("c1", 0).len() == 1).await;
    assert_eq!(cards.get_card_messages("c1", 0)[0].payload, Payload::Structured(json!(42)));

    session.disconnect().await;
}

#[tokio::test]
async fn integration_last_connection_restored_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let path = path.to_str().unwrap();
    let broker = MemoryBroker::new();

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(path, "popdash_").unwrap());
        let manager = ConnectionManager::new(BrokerSession::new(broker.transport()), store);
        let config = ConnectionConfig::new(["ws://x"]).named("Saved").with_options(options(false));
        manager.connect(config).await.unwrap();
        manager.disconnect().await;
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(path, "popdash_").unwrap());
    let manager = ConnectionManager::new(BrokerSession::new(broker.transport()), store);

    assert!(manager.restore_on_startup().await.unwrap());
    assert!(manager.session().is_connected());
    assert_eq!(manager.profiles().find_by_name("Saved").unwrap().config.servers, vec!["ws://x"]);
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn integration_invalid_config_never_reaches_the_broker() {
    let broker = MemoryBroker::new();
    let session = BrokerSession::new(broker.transport());
    let mut config = ConnectionConfig::new(Vec::<String>::new());
    config.auth_type = crate::config::AuthType::Userpass;

    let report = validate(&config);
    assert!(!report.is_valid);
    assert!(report.errors.len() >= 2);

    assert!(session.connect(config).await.is_err());
    assert_eq!(broker.connect_count(), 0);
}
