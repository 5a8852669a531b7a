//! The `persistence` module stores small JSON documents between runs:
//! the last-used connection, saved connection profiles, the dashboard layout,
//! per-card configuration and user preferences.
//!
//! Everything goes through the `KeyValueStore` trait. Keys are namespaced with
//! a prefix so several dashboards can share one database. `sled_store` keeps
//! documents on disk; `memory` keeps them in a map for tests and throwaway
//! runs. `documents` layers typed accessors on top.

pub mod documents;
pub mod memory;
pub mod sled_store;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::utils::StoreError;

pub use documents::Documents;
pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// A namespaced store of JSON values.
///
/// Implementors provide the raw operations on fully-prefixed keys. The
/// provided methods add the prefix, log failures and report them as
/// `false`/`None` instead of returning errors.
pub trait KeyValueStore: Send + Sync {
    fn prefix(&self) -> &str;

    fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn store(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every raw key in the backing store, prefixed or not.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }

    fn get(&self, key: &str) -> Option<Value> {
        match self.load(&self.full_key(key)) {
            Ok(value) => {
                if value.is_none() {
                    debug!("No data found for key: {key}");
                }
                value
            }
            Err(e) => {
                error!("Error in get({key}): {e}");
                None
            }
        }
    }

    fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    fn set(&self, key: &str, value: &Value) -> bool {
        match self.store(&self.full_key(key), value) {
            Ok(()) => {
                debug!("Stored data for key: {key}");
                true
            }
            Err(e) => {
                error!("Error in set({key}): {e}");
                false
            }
        }
    }

    fn remove(&self, key: &str) -> bool {
        match self.delete(&self.full_key(key)) {
            Ok(()) => {
                debug!("Removed data for key: {key}");
                true
            }
            Err(e) => {
                error!("Error in remove({key}): {e}");
                false
            }
        }
    }

    fn has(&self, key: &str) -> bool {
        matches!(self.load(&self.full_key(key)), Ok(Some(_)))
    }

    /// Removes every key carrying this store's prefix.
    fn clear_all(&self) -> bool {
        let keys = match self.keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!("Error in clear_all: {e}");
                return false;
            }
        };

        let owned: Vec<String> = keys
            .into_iter()
            .filter(|key| key.starts_with(self.prefix()))
            .collect();
        for key in &owned {
            if let Err(e) = self.delete(key) {
                error!("Error in clear_all({key}): {e}");
                return false;
            }
        }
        debug!("Cleared {} items from storage", owned.len());
        true
    }
}

/// Reads `key` and deserializes it, treating malformed documents as absent.
pub fn get_typed<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let value = store.get(key)?;
    match serde_json::from_value(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            error!("Stored value for {key} is malformed: {e}");
            None
        }
    }
}

pub fn set_typed<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> bool {
    match serde_json::to_value(value) {
        Ok(value) => store.set(key, &value),
        Err(e) => {
            error!("Error serializing {key}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests;
