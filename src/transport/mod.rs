//! The `transport` module is the boundary between the session layer and the
//! broker's wire protocol.
//!
//! It defines the contract every transport fulfils (connect, publish,
//! subscribe, unsubscribe, close, and a closed signal for broker-initiated
//! disconnects) and ships two implementations:
//!
//! - `websocket`: speaks the popsub JSON protocol over `tokio-tungstenite`.
//! - `memory`: an in-process broker, used by tests and local runs.

pub mod memory;
pub mod message;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::config::ConnectionConfig;
use crate::utils::TransportError;

pub use memory::{MemoryBroker, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Transport-local subscription handle.
pub type TransportSid = u64;

/// A raw inbound frame as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub subject: String,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(subject: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            data: data.into(),
        }
    }
}

/// Why a transport stopped. `error` is `None` for an orderly close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    pub error: Option<String>,
}

/// Receiving side of one transport subscription. Frames arrive in broker order.
#[derive(Debug)]
pub struct FrameSubscription {
    pub sid: TransportSid,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportHandle>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, subject: &str) -> Result<FrameSubscription, TransportError>;

    /// Unknown sids are ignored.
    async fn unsubscribe(&self, sid: TransportSid) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Resolves to `Some` once the connection is gone, whoever closed it.
    fn closed(&self) -> watch::Receiver<Option<CloseReason>>;
}

#[cfg(test)]
mod tests;
