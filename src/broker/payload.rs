use serde::Serialize;
use serde_json::Value;

use crate::utils::BrokerError;

/// A message body, decoded best-effort from wire bytes.
///
/// Bodies that parse as JSON become `Structured`; anything else is kept as
/// `Raw` text. Outbound, `Raw` text and JSON strings are sent verbatim and
/// every other JSON value is encoded. Serialization is one-way: a `Raw` body
/// and a structured JSON string look the same once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(Value),
    Raw(String),
}

impl Payload {
    pub fn decode(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Payload::Structured(value),
            Err(_) => Payload::Raw(text.into_owned()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Payload::Raw(text) => text.clone(),
            Payload::Structured(Value::String(text)) => text.clone(),
            Payload::Structured(value) => value.to_string(),
        }
    }

    /// Builds a structured payload from any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, BrokerError> {
        serde_json::to_value(value)
            .map(Payload::Structured)
            .map_err(|e| BrokerError::InvalidPayload(e.to_string()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Structured(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Raw(text) => Some(text),
            Payload::Structured(Value::String(text)) => Some(text),
            Payload::Structured(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Raw(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}
