use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::payload::Payload;
use super::subscription::SubscriptionId;

/// A decoded frame handed to a subscription's message handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription_id: SubscriptionId,
    pub topic: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

/// A message as kept in a card's history.
///
/// # Fields
///
/// - `id` - Unique per received message.
/// - `topic` - The subject the broker delivered it on.
/// - `payload` - Structured JSON when the body parsed, raw text otherwise.
/// - `received_at` - When the session decoded the frame.
/// - `subscription_id` - The subscription that delivered it, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::with_time(topic, payload, Utc::now())
    }

    pub fn with_time(
        topic: impl Into<String>,
        payload: impl Into<Payload>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            topic: topic.into(),
            payload: payload.into(),
            received_at,
            subscription_id: None,
        }
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Self {
            subscription_id: Some(delivery.subscription_id),
            ..Self::with_time(delivery.topic, delivery.payload, delivery.timestamp)
        }
    }
}
