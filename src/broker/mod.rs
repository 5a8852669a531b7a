//! The `broker` module owns the single connection to the message broker.
//!
//! `session::BrokerSession` drives the transport, `events` fans lifecycle
//! notifications out to listeners, and `payload`/`message` describe what
//! travels over a subscription.

pub mod events;
pub mod message;
pub mod payload;
pub mod session;
pub mod subscription;

pub use events::{DisconnectReason, ErrorKind, ListenerId, SessionEvent};
pub use message::{Delivery, Message};
pub use payload::Payload;
pub use session::{BrokerSession, SessionOptions, SessionSnapshot, SessionStatus, validate_topic};
pub use subscription::SubscriptionId;
