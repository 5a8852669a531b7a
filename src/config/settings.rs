use serde::Deserialize;

/// Top-level application settings.
///
/// Connection details are not part of this; they are per-dashboard data
/// handled by [`ConnectionConfig`](super::ConnectionConfig).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cards: CardSettings,
    pub session: SessionSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Per-card history capacities and the metrics window.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CardSettings {
    pub message_history: usize,
    pub publish_history: usize,
    pub rate_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub connect_timeout_ms: u64,
    pub max_payload_bytes: usize,
}

/// Where persisted documents live and how their keys are namespaced.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub path: String,
    pub key_prefix: String,
}

/// Partial settings as loaded from files or the environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub logging: Option<PartialLoggingSettings>,
    pub cards: Option<PartialCardSettings>,
    pub session: Option<PartialSessionSettings>,
    pub storage: Option<PartialStorageSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialCardSettings {
    pub message_history: Option<usize>,
    pub publish_history: Option<usize>,
    pub rate_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSessionSettings {
    pub connect_timeout_ms: Option<u64>,
    pub max_payload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub key_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            cards: CardSettings {
                message_history: 1000,
                publish_history: 100,
                rate_window_secs: 10,
            },
            session: SessionSettings {
                connect_timeout_ms: 5000,
                max_payload_bytes: 1024 * 1024,
            },
            storage: StorageSettings {
                path: "popdash_data".to_string(),
                key_prefix: "popdash_".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlays whatever was provided onto `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let logging = self.logging;
        let cards = self.cards;
        let session = self.session;
        let storage = self.storage;

        Settings {
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(defaults.logging.level),
            },
            cards: CardSettings {
                message_history: cards
                    .as_ref()
                    .and_then(|c| c.message_history)
                    .unwrap_or(defaults.cards.message_history),
                publish_history: cards
                    .as_ref()
                    .and_then(|c| c.publish_history)
                    .unwrap_or(defaults.cards.publish_history),
                rate_window_secs: cards
                    .as_ref()
                    .and_then(|c| c.rate_window_secs)
                    .unwrap_or(defaults.cards.rate_window_secs),
            },
            session: SessionSettings {
                connect_timeout_ms: session
                    .as_ref()
                    .and_then(|s| s.connect_timeout_ms)
                    .unwrap_or(defaults.session.connect_timeout_ms),
                max_payload_bytes: session
                    .as_ref()
                    .and_then(|s| s.max_payload_bytes)
                    .unwrap_or(defaults.session.max_payload_bytes),
            },
            storage: StorageSettings {
                path: storage
                    .as_ref()
                    .and_then(|s| s.path.clone())
                    .unwrap_or(defaults.storage.path),
                key_prefix: storage
                    .as_ref()
                    .and_then(|s| s.key_prefix.clone())
                    .unwrap_or(defaults.storage.key_prefix),
            },
        }
    }
}
