use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tungstenite::protocol::Message as WsMessage;

use super::memory::PUBLISHED_HISTORY;
use super::message::{ClientMessage, ServerMessage};
use super::*;
use crate::config::ConnectionConfig;
use crate::utils::TransportError;

fn memory_config() -> ConnectionConfig {
    ConnectionConfig::new(["ws://localhost:8080"])
}

async fn next_frame(sub: &mut FrameSubscription) -> Frame {
    timeout(Duration::from_secs(1), sub.frames.recv())
        .await
        .expect("frame timed out")
        .expect("subscription closed")
}

#[test]
fn test_client_message_wire_format() {
    let publish = ClientMessage::Publish {
        topic: "news".into(),
        payload: "hello".into(),
        message_id: None,
        qos: Some(0),
    };
    let frame = publish.to_ws().unwrap();
    let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();

    assert_eq!(
        value,
        json!({"type": "publish", "topic": "news", "payload": "hello", "message_id": null, "qos": 0})
    );

    let ack = serde_json::to_value(ClientMessage::Ack { message_id: "m1".into() }).unwrap();
    assert_eq!(ack, json!({"type": "ack", "message_id": "m1"}));
}

#[test]
fn test_parse_tagged_control_frames() {
    assert_eq!(
        ServerMessage::parse(r#"{"type":"login_response","token":"t"}"#).unwrap(),
        ServerMessage::LoginResponse { token: "t".into() }
    );
    assert_eq!(
        ServerMessage::parse(r#"{"type":"authenticated"}"#).unwrap(),
        ServerMessage::Authenticated {}
    );
    assert_eq!(
        ServerMessage::parse(r#"{"type":"error","message":"nope"}"#).unwrap(),
        ServerMessage::Error { message: "nope".into() }
    );
}

#[test]
fn test_parse_untagged_delivery() {
    let parsed = ServerMessage::parse(r#"{"topic":"news","payload":"hi","timestamp":5}"#).unwrap();

    assert_eq!(
        parsed,
        ServerMessage::Message {
            topic: "news".into(),
            payload: "hi".into(),
            timestamp: 5,
            message_id: String::new(),
            qos: 0,
        }
    );
}

#[test]
fn test_parse_rejects_garbage() {
    let err = ServerMessage::parse("not json").unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
}

#[tokio::test]
async fn test_memory_fan_out_includes_publisher() {
    let broker = MemoryBroker::new();
    let transport = broker.transport();
    let a = transport.connect(&memory_config()).await.unwrap();
    let b = transport.connect(&memory_config()).await.unwrap();

    let mut sub_a = a.subscribe("news").await.unwrap();
    let mut sub_b = b.subscribe("news").await.unwrap();
    a.publish("news", b"hi".to_vec()).await.unwrap();

    assert_eq!(next_frame(&mut sub_a).await, Frame::new("news", "hi"));
    assert_eq!(next_frame(&mut sub_b).await, Frame::new("news", "hi"));
    assert_eq!(broker.subscriber_count("news"), 2);
    assert_eq!(broker.client_count(), 2);
    assert_eq!(broker.published(), vec![Frame::new("news", "hi")]);
}

#[test]
fn test_memory_published_log_is_bounded() {
    let broker = MemoryBroker::new();

    for n in 0..PUBLISHED_HISTORY + 5 {
        broker.publish("news", n.to_string());
    }

    let published = broker.published();
    assert_eq!(published.len(), PUBLISHED_HISTORY);
    assert_eq!(published[0], Frame::new("news", "5"));
}

#[test]
fn test_websocket_timeout_from_settings() {
    let settings = crate::config::Settings::default();
    let transport = WebSocketTransport::from_settings(&settings.session);
    assert_eq!(transport.connect_timeout(), Duration::from_millis(5000));
}

#[tokio::test]
async fn test_memory_unsubscribe_stops_frames() {
    let broker = MemoryBroker::new();
    let handle = broker.transport().connect(&memory_config()).await.unwrap();
    let mut sub = handle.subscribe("news").await.unwrap();

    handle.unsubscribe(sub.sid).await.unwrap();
    handle.unsubscribe(999).await.unwrap();
    broker.publish("news", "late");

    assert_eq!(broker.subscriber_count("news"), 0);
    assert!(sub.frames.recv().await.is_none());
}

#[tokio::test]
async fn test_memory_credentials_and_rejection() {
    let broker = MemoryBroker::new();
    broker.require_credentials("admin", "secret");
    let transport = broker.transport();

    let err = transport.connect(&memory_config()).await.err().unwrap();
    assert_eq!(err, TransportError::Rejected("invalid credentials".into()));

    let config = memory_config().with_userpass("admin", "secret");
    assert!(transport.connect(&config).await.is_ok());

    broker.fail_next_connect("maintenance");
    let err = transport.connect(&config).await.err().unwrap();
    assert_eq!(err.to_string(), "unable to reach ws://localhost:8080: maintenance");
    assert!(transport.connect(&config).await.is_ok());
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn test_memory_drop_connections_signals_close() {
    let broker = MemoryBroker::new();
    let handle = broker.transport().connect(&memory_config()).await.unwrap();
    let mut closed = handle.closed();

    broker.drop_connections(Some("restarting"));

    let reason = timeout(Duration::from_secs(1), closed.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(reason, Some(CloseReason { error: Some("restarting".into()) }));
    assert_eq!(broker.client_count(), 0);
    assert_eq!(handle.publish("news", vec![]).await, Err(TransportError::Closed));
    assert!(handle.closed().borrow().is_some());
}

#[tokio::test]
async fn test_memory_close_is_orderly() {
    let broker = MemoryBroker::new();
    let handle = broker.transport().connect(&memory_config()).await.unwrap();
    let closed = handle.closed();

    handle.close().await.unwrap();

    assert_eq!(*closed.borrow(), Some(CloseReason::default()));
    assert!(handle.subscribe("news").await.is_err());
}

/// A single-connection popsub broker. Every client frame it receives is
/// forwarded to the returned channel.
async fn fake_popsub_server() -> (String, mpsc::UnboundedReceiver<ClientMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            let Ok(text) = msg.to_text() else { continue };
            let Ok(client_msg) = serde_json::from_str::<ClientMessage>(text) else {
                continue;
            };

            let reply = match &client_msg {
                ClientMessage::Login { password, .. } if password == "secret" => {
                    Some(json!({"type": "login_response", "token": "tok"}))
                }
                ClientMessage::Login { .. } => {
                    Some(json!({"type": "error", "message": "bad credentials"}))
                }
                ClientMessage::Auth { token } if token == "tok" => {
                    Some(json!({"type": "authenticated"}))
                }
                ClientMessage::Auth { .. } => Some(json!({"type": "error", "message": "bad token"})),
                ClientMessage::Subscribe { topic } => Some(json!({
                    "topic": topic,
                    "payload": "{\"v\":1}",
                    "timestamp": 1,
                    "message_id": "m1",
                    "qos": 1
                })),
                _ => None,
            };
            let hang_up = matches!(&client_msg, ClientMessage::Publish { payload, .. } if payload == "bye");

            if let Some(reply) = reply {
                if ws.send(WsMessage::text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = seen_tx.send(client_msg);
            if hang_up {
                let _ = ws.send(WsMessage::Close(None)).await;
                break;
            }
        }
    });

    (url, seen_rx)
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<ClientMessage>) -> ClientMessage {
    timeout(Duration::from_secs(2), seen.recv())
        .await
        .expect("server saw nothing")
        .expect("server stopped")
}

#[tokio::test]
async fn test_websocket_userpass_subscribe_and_ack() {
    let (url, mut seen) = fake_popsub_server().await;
    let transport = WebSocketTransport::new(Duration::from_secs(2));
    let config = ConnectionConfig::new([url]).with_userpass("admin", "secret");

    let handle = transport.connect(&config).await.unwrap();
    assert!(matches!(next_seen(&mut seen).await, ClientMessage::Login { .. }));
    assert_eq!(next_seen(&mut seen).await, ClientMessage::Auth { token: "tok".into() });

    let mut sub = handle.subscribe("news").await.unwrap();
    let mut second = handle.subscribe("news").await.unwrap();
    assert_eq!(next_seen(&mut seen).await, ClientMessage::Subscribe { topic: "news".into() });

    let frame = next_frame(&mut sub).await;
    assert_eq!(frame, Frame::new("news", "{\"v\":1}"));
    assert_eq!(next_seen(&mut seen).await, ClientMessage::Ack { message_id: "m1".into() });

    // The broker only learned about the topic once; the second local
    // subscription was registered before the delivery arrived.
    assert_eq!(next_frame(&mut second).await, frame);

    handle.publish("news", b"out".to_vec()).await.unwrap();
    assert_eq!(
        next_seen(&mut seen).await,
        ClientMessage::Publish {
            topic: "news".into(),
            payload: "out".into(),
            message_id: None,
            qos: Some(0),
        }
    );

    handle.close().await.unwrap();
    assert!(handle.closed().borrow().is_some());
}

#[tokio::test]
async fn test_websocket_rejected_login() {
    let (url, _seen) = fake_popsub_server().await;
    let transport = WebSocketTransport::new(Duration::from_secs(2));
    let config = ConnectionConfig::new([url]).with_userpass("admin", "wrong");

    let err = transport.connect(&config).await.err().unwrap();
    assert_eq!(err, TransportError::Rejected("bad credentials".into()));
}

#[tokio::test]
async fn test_websocket_broker_close_is_signalled() {
    let (url, mut seen) = fake_popsub_server().await;
    let transport = WebSocketTransport::new(Duration::from_secs(2));
    let handle = transport.connect(&ConnectionConfig::new([url])).await.unwrap();
    let mut closed = handle.closed();

    handle.publish("news", b"bye".to_vec()).await.unwrap();
    assert!(matches!(next_seen(&mut seen).await, ClientMessage::Publish { .. }));

    let reason = timeout(Duration::from_secs(2), closed.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(reason.is_some());
    assert_eq!(handle.subscribe("news").await.err(), Some(TransportError::Closed));
}

#[tokio::test]
async fn test_websocket_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = WebSocketTransport::new(Duration::from_secs(2));
    let err = transport.connect(&ConnectionConfig::new([url.clone()])).await.err().unwrap();

    assert!(matches!(err, TransportError::Connect { server, .. } if server == url));
}
