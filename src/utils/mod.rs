//! The `utils` module provides the pieces shared by every other module of
//! `popdash`: the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result, StoreError, TransportError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, TransportError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn invalid_config_lists_every_problem() {
        let err = BrokerError::InvalidConfig(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "invalid connection configuration: a; b");
    }

    #[test]
    fn transport_errors_map_onto_broker_errors() {
        assert_eq!(
            BrokerError::from(TransportError::Closed),
            BrokerError::NotConnected
        );
        let err = BrokerError::from(TransportError::Rejected("bad token".into()));
        assert_eq!(
            err,
            BrokerError::ConnectFailed("broker rejected the connection: bad token".into())
        );
    }
}
