use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::connection::{ConnectionConfig, sanitize, validate};
use super::profiles::ProfileStore;
use crate::broker::{BrokerSession, SessionSnapshot, SessionStatus};
use crate::persistence::{Documents, KeyValueStore};
use crate::transport::BrokerTransport;
use crate::utils::error::Result;

/// Connects a throwaway session with `config` and disconnects it again.
/// The shared session is never touched.
pub async fn test_connection(transport: Arc<dyn BrokerTransport>, config: &ConnectionConfig) -> bool {
    let report = validate(config);
    if !report.is_valid {
        warn!("Connection test skipped: {}", report.errors.join("; "));
        return false;
    }

    let session = BrokerSession::new(transport);
    match session.connect(config.clone()).await {
        Ok(()) => {
            session.disconnect().await;
            info!("Connection test succeeded");
            true
        }
        Err(e) => {
            error!("Connection test failed: {e}");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub status: SessionStatus,
    pub status_text: String,
    pub can_connect: bool,
    pub can_disconnect: bool,
    pub snapshot: SessionSnapshot,
}

/// Owns the shared session's configuration side: the last-used connection
/// and the saved profile list.
#[derive(Debug)]
pub struct ConnectionManager {
    session: BrokerSession,
    profiles: ProfileStore,
    documents: Documents,
}

impl ConnectionManager {
    pub fn new(session: BrokerSession, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            session,
            profiles: ProfileStore::load(store.clone()),
            documents: Documents::new(store),
        }
    }

    pub fn session(&self) -> &BrokerSession {
        &self.session
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn documents(&self) -> &Documents {
        &self.documents
    }

    /// Connects the shared session, then remembers `config` as last-used and
    /// as a saved profile. Only sanitized copies are persisted.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<()> {
        self.session.connect(config.clone()).await?;

        if !self.documents.set_connection_config(&sanitize(&config)) {
            warn!("Could not persist the last-used connection");
        }
        self.profiles.save_profile(&config);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.session.reconnect().await
    }

    pub async fn test_connection(&self, config: &ConnectionConfig) -> bool {
        test_connection(self.session.transport(), config).await
    }

    /// Reconnects with the last-used connection when it asked for that.
    /// Returns whether a connection was made.
    pub async fn restore_on_startup(&self) -> Result<bool> {
        let Some(config) = self.documents.connection_config() else {
            return Ok(false);
        };
        if !config.options.auto_reconnect_on_startup || self.session.is_connected() {
            return Ok(false);
        }
        if config.has_redacted_credentials() {
            warn!("Last-used connection has no stored credentials, not restoring");
            return Ok(false);
        }

        info!("Restoring last connection to {}", config.servers.join(", "));
        self.connect(config).await?;
        Ok(true)
    }

    pub fn info(&self) -> ConnectionInfo {
        let snapshot = self.session.snapshot();
        let connecting = self.session.is_connecting() || snapshot.status == SessionStatus::Connecting;
        let status_text = match snapshot.status {
            _ if connecting => "Connecting...".to_string(),
            SessionStatus::Connected => "Connected".to_string(),
            SessionStatus::Error => snapshot
                .last_error
                .clone()
                .unwrap_or_else(|| "Connection Error".to_string()),
            _ => "Disconnected".to_string(),
        };

        ConnectionInfo {
            status: snapshot.status,
            status_text,
            can_connect: !connecting && snapshot.status != SessionStatus::Connected,
            can_disconnect: !connecting && snapshot.status == SessionStatus::Connected,
            snapshot,
        }
    }
}
