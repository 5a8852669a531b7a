use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

use crate::utils::TransportError;

/// Frames sent from this client to a popsub broker.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "auth")]
    Auth { token: String },
    #[serde(rename = "login")]
    Login { username: String, password: String },
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        payload: String,
        message_id: Option<String>,
        qos: Option<u8>,
    },
    #[serde(rename = "ack")]
    Ack { message_id: String },
}

/// Frames a popsub broker sends back.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "login_response")]
    LoginResponse { token: String },
    #[serde(rename = "authenticated")]
    Authenticated {},
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "message")]
    Message {
        topic: String,
        payload: String,
        timestamp: i64,
        message_id: String,
        qos: u8,
    },
}

impl ClientMessage {
    pub fn to_ws(&self) -> Result<WsMessage, TransportError> {
        serde_json::to_string(self)
            .map(WsMessage::text)
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

/// A broker message fanned out to subscribers. popsub brokers send these
/// without a `type` tag.
#[derive(Debug, Deserialize)]
struct BrokerMessage {
    topic: String,
    payload: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    qos: u8,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Control(ServerMessage),
    Delivery(BrokerMessage),
}

impl ServerMessage {
    /// Parses any frame a broker may send, tagged or not.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let inbound: Inbound = serde_json::from_str(text).map_err(|e| {
            TransportError::Protocol(format!(
                "{e} | {}",
                text.chars().take(100).collect::<String>()
            ))
        })?;

        Ok(match inbound {
            Inbound::Control(msg) => msg,
            Inbound::Delivery(msg) => ServerMessage::Message {
                topic: msg.topic,
                payload: msg.payload,
                timestamp: msg.timestamp,
                message_id: msg.message_id,
                qos: msg.qos,
            },
        })
    }
}
