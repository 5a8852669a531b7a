use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::transport::TransportSid;

/// Identifies one session-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Bookkeeping for a subscription the session currently holds open.
///
/// The `live` flag is the delivery task's cancellation token: the task checks
/// it before every dispatch, and `cancel` clears it before aborting the task.
#[derive(Debug)]
pub(crate) struct ActiveSubscription {
    pub topic: String,
    pub sid: TransportSid,
    pub created_at: DateTime<Utc>,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    pub fn new(topic: String, sid: TransportSid, live: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            topic,
            sid,
            created_at: Utc::now(),
            live,
            task,
        }
    }

    pub fn cancel(&self) {
        self.live.store(false, Ordering::Release);
        self.task.abort();
    }
}
