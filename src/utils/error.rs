//! The `error` module defines the error types used within `popdash`.
//!
//! Every fallible operation in the session, multiplexer and persistence
//! layers returns one of these. The card store never propagates them to its
//! callers; it records the `Display` text on the card instead.

use thiserror::Error;

/// Errors surfaced by the broker session and the multiplexer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection already in progress")]
    AlreadyConnecting,

    #[error("invalid connection configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("no previous configuration available for reconnection")]
    NoPriorConfig,

    #[error("invalid topic {0:?}")]
    InvalidTopic(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("Connection lost")]
    ConnectionLost,
}

/// Errors reported by a [`crate::transport::BrokerTransport`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unable to reach {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport is closed")]
    Closed,

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Errors raised by the key-value persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<TransportError> for BrokerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => BrokerError::NotConnected,
            other => BrokerError::ConnectFailed(other.to_string()),
        }
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
