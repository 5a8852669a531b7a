use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::connection::{ConnectionConfig, sanitize};
use crate::persistence::{KeyValueStore, get_typed, set_typed};
use crate::utils::lock;

pub const SAVED_CONNECTIONS: &str = "saved_connections";

/// A named connection the user can pick again later. Always sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedProfile {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    #[serde(flatten)]
    pub config: ConnectionConfig,
}

/// The saved connection list, mirrored in memory and written through to the
/// key-value store on every change.
pub struct ProfileStore {
    store: Arc<dyn KeyValueStore>,
    profiles: Mutex<Vec<SavedProfile>>,
}

impl ProfileStore {
    /// Loads whatever list was saved before. A missing or malformed list
    /// starts empty.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let profiles: Vec<SavedProfile> =
            get_typed(store.as_ref(), SAVED_CONNECTIONS).unwrap_or_default();
        info!("Loaded {} saved connections", profiles.len());
        Self {
            store,
            profiles: Mutex::new(profiles),
        }
    }

    pub fn list(&self) -> Vec<SavedProfile> {
        lock(&self.profiles).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.profiles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_name(&self, name: &str) -> Option<SavedProfile> {
        lock(&self.profiles)
            .iter()
            .find(|profile| profile.config.name.as_deref() == Some(name))
            .cloned()
    }

    /// Saves `config` under its name, replacing a profile with the same name.
    /// Unnamed configs are not saved and yield `None`.
    pub fn save_profile(&self, config: &ConnectionConfig) -> Option<SavedProfile> {
        let name = config.name.as_deref()?;
        let sanitized = sanitize(config);

        let mut profiles = lock(&self.profiles);
        let saved = match profiles
            .iter_mut()
            .find(|profile| profile.config.name.as_deref() == Some(name))
        {
            Some(existing) => {
                existing.config = sanitized;
                existing.clone()
            }
            None => {
                let profile = SavedProfile {
                    id: format!("config_{}", Uuid::new_v4().simple()),
                    created_at: Utc::now().timestamp_millis(),
                    config: sanitized,
                };
                profiles.push(profile.clone());
                profile
            }
        };

        if !set_typed(self.store.as_ref(), SAVED_CONNECTIONS, &*profiles) {
            warn!("Saved connection {name} only kept in memory");
        }
        Some(saved)
    }

    pub fn remove_profile(&self, id: &str) -> bool {
        let mut profiles = lock(&self.profiles);
        let Some(index) = profiles.iter().position(|profile| profile.id == id) else {
            return false;
        };
        profiles.remove(index);
        set_typed(self.store.as_ref(), SAVED_CONNECTIONS, &*profiles);
        true
    }

    pub fn clear(&self) {
        lock(&self.profiles).clear();
        self.store.remove(SAVED_CONNECTIONS);
    }
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("profiles", &self.len())
            .finish()
    }
}
