//! # PopDash
//!
//! `popdash` is the client-side engine of a real-time messaging dashboard.
//! A dashboard is a set of cards; each card may watch one broker topic and
//! publish to any topic. This crate owns everything below the UI: the broker
//! connection, the routing of messages to cards, per-card history and
//! metrics, and the persisted connection profiles and dashboard documents.
//!
//! ## Core Modules
//!
//! - `broker`: The broker session. Connects, publishes, subscribes, tracks status
//!   and emits lifecycle events to listeners.
//! - `mux`: Binds cards to session subscriptions, at most one per card.
//! - `cards`: Per-card status, bounded message and publish history, and metrics.
//! - `config`: Connection configs, validation, saved profiles and the connection
//!   manager, plus the crate's own settings.
//! - `persistence`: Prefixed key-value storage (`sled` or in-memory) and the
//!   dashboard documents kept in it.
//! - `transport`: The wire boundary. A popsub WebSocket client and an in-process
//!   broker.
//! - `utils`: Error types, logging setup and shared helpers.

pub mod broker;
pub mod cards;
pub mod config;
pub mod mux;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::{BrokerSession, Message, Payload, SessionEvent, SessionStatus};
pub use cards::{CardStatus, CardStore};
pub use config::{ConnectionConfig, ConnectionManager, Settings, load_config};
pub use mux::Multiplexer;
pub use persistence::{Documents, KeyValueStore, MemoryStore, SledStore};
pub use transport::{MemoryBroker, WebSocketTransport};
pub use utils::{BrokerError, Result, StoreError, TransportError};

#[cfg(test)]
mod tests;
