use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::Payload;
use crate::config::CardSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    #[default]
    Idle,
    Subscribing,
    Subscribed,
    Publishing,
    Disconnected,
    Error,
}

/// What the UI shows about a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardState {
    pub id: String,
    pub card_type: String,
    pub status: CardStatus,
    pub error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub topic: Option<String>,
}

impl CardState {
    pub fn new(id: impl Into<String>, card_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            card_type: card_type.into(),
            status: CardStatus::Idle,
            error: None,
            last_activity: None,
            topic: None,
        }
    }
}

/// Derived traffic figures. Recomputed on every delivery, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Messages delivered since the card was initialized or last cleared.
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub last_message_time: Option<DateTime<Utc>>,
    /// Failed subscribe or publish attempts.
    pub error_count: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            total_messages: 0,
            messages_per_second: 0.0,
            last_message_time: None,
            error_count: 0,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardLimits {
    pub message_history: usize,
    pub publish_history: usize,
    pub rate_window: Duration,
}

impl Default for CardLimits {
    fn default() -> Self {
        Self {
            message_history: 1000,
            publish_history: 100,
            rate_window: Duration::from_secs(10),
        }
    }
}

impl From<&CardSettings> for CardLimits {
    fn from(settings: &CardSettings) -> Self {
        Self {
            message_history: settings.message_history,
            publish_history: settings.publish_history,
            rate_window: Duration::from_secs(settings.rate_window_secs.max(1)),
        }
    }
}
