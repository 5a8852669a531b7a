use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::{KeyValueStore, get_typed, set_typed};
use crate::config::ConnectionConfig;

pub const CONNECTION_CONFIG: &str = "connection_config";
pub const DASHBOARD_CONFIG: &str = "dashboard_config";
pub const USER_PREFERENCES: &str = "user_preferences";
pub const CARD_CONFIGS: &str = "card_configs";

pub const EXPORT_VERSION: &str = "1.0.0";

/// Typed access to the dashboard's persisted documents.
///
/// Dashboard and card blobs are opaque JSON objects owned by the UI. They are
/// stored wrapped with a timestamp and handed back exactly as given.
#[derive(Clone)]
pub struct Documents {
    store: Arc<dyn KeyValueStore>,
}

impl Documents {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Saves the last-used connection. Callers pass an already sanitized
    /// config when secrets must not reach disk.
    pub fn set_connection_config(&self, config: &ConnectionConfig) -> bool {
        let Ok(Value::Object(mut fields)) = serde_json::to_value(config) else {
            warn!("Invalid connection config provided");
            return false;
        };
        fields.insert("timestamp".into(), json!(now_ms()));
        self.store.set(CONNECTION_CONFIG, &Value::Object(fields))
    }

    pub fn connection_config(&self) -> Option<ConnectionConfig> {
        get_typed(self.store.as_ref(), CONNECTION_CONFIG)
    }

    pub fn clear_connection_config(&self) -> bool {
        self.store.remove(CONNECTION_CONFIG)
    }

    pub fn set_dashboard_config(&self, config: &Value) -> bool {
        if !config.is_object() {
            warn!("Invalid dashboard config provided");
            return false;
        }
        self.store.set(
            DASHBOARD_CONFIG,
            &json!({ "config": config, "timestamp": now_ms() }),
        )
    }

    pub fn dashboard_config(&self) -> Option<Value> {
        self.store.get(DASHBOARD_CONFIG).map(unwrap_field("config"))
    }

    /// Card configurations keyed by card id.
    pub fn set_card_configs(&self, configs: &Value) -> bool {
        if !configs.is_object() {
            warn!("Invalid card configs provided");
            return false;
        }
        self.store.set(
            CARD_CONFIGS,
            &json!({ "configs": configs, "timestamp": now_ms() }),
        )
    }

    pub fn card_configs(&self) -> Value {
        self.store
            .get(CARD_CONFIGS)
            .and_then(|stored| stored.get("configs").cloned())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn set_user_preferences(&self, preferences: &Value) -> bool {
        let Value::Object(preferences) = preferences else {
            warn!("Invalid user preferences provided");
            return false;
        };
        set_typed(self.store.as_ref(), USER_PREFERENCES, preferences)
    }

    /// Stored preferences laid over the defaults, one level deep.
    pub fn user_preferences(&self) -> Value {
        let mut preferences = default_preferences();
        if let (Some(Value::Object(stored)), Value::Object(merged)) =
            (self.store.get(USER_PREFERENCES), &mut preferences)
        {
            merged.extend(stored);
        }
        preferences
    }

    pub fn update_user_preference(&self, key: &str, value: Value) -> bool {
        let mut preferences = self.user_preferences();
        if let Value::Object(fields) = &mut preferences {
            fields.insert(key.to_string(), value);
        }
        self.set_user_preferences(&preferences)
    }

    pub fn export_config(&self) -> Value {
        json!({
            "dashboard": self.dashboard_config(),
            "cards": self.card_configs(),
            "preferences": self.user_preferences(),
            "exportTimestamp": now_ms(),
            "version": EXPORT_VERSION,
        })
    }

    /// Imports whichever of `dashboard`, `cards` and `preferences` the bundle
    /// carries. Returns false for anything that is not a JSON object.
    pub fn import_config(&self, bundle: &Value) -> bool {
        let Value::Object(bundle) = bundle else {
            warn!("Invalid config data for import");
            return false;
        };

        let mut imported = 0;
        let mut ok = true;
        if let Some(dashboard) = bundle.get("dashboard").filter(|v| !v.is_null()) {
            ok &= self.set_dashboard_config(dashboard);
            imported += 1;
        }
        if let Some(cards) = bundle.get("cards").filter(|v| !v.is_null()) {
            ok &= self.set_card_configs(cards);
            imported += 1;
        }
        if let Some(preferences) = bundle.get("preferences").filter(|v| !v.is_null()) {
            ok &= self.set_user_preferences(preferences);
            imported += 1;
        }

        info!("Imported {imported} configuration sections");
        ok
    }
}

impl std::fmt::Debug for Documents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Documents")
            .field("prefix", &self.store.prefix())
            .finish()
    }
}

pub fn default_preferences() -> Value {
    json!({
        "theme": "light",
        "gridOptions": {
            "cellHeight": 100,
            "margin": 5,
            "animate": true
        },
        "notifications": {
            "connection": true,
            "errors": true,
            "success": true
        }
    })
}

fn unwrap_field(field: &'static str) -> impl Fn(Value) -> Value {
    move |mut stored| match stored.get_mut(field) {
        Some(inner) => inner.take(),
        None => stored,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
