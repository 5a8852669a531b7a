//! The `cards` module keeps everything the dashboard knows about each card:
//! its status, bounded message and publish histories, and traffic metrics.
//!
//! Cards reach the broker through the multiplexer; the card table is the
//! multiplexer's sink for routed messages and connection changes.

pub mod history;
pub mod state;
pub mod store;

pub use history::BoundedHistory;
pub use state::{CardLimits, CardState, CardStatus, Metrics, PublishRecord};
pub use store::{CardStore, DEFAULT_CARD_TYPE};
