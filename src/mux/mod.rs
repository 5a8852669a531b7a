//! The `mux` module multiplexes the session's subscriptions across cards.
//!
//! Each card holds at most one binding to a session subscription. Deliveries
//! are checked against the current binding before they reach the card sink,
//! and a lost connection releases every binding at once.

pub mod multiplexer;

pub use multiplexer::{Binding, CardId, CardSink, Multiplexer};

#[cfg(test)]
mod tests;
