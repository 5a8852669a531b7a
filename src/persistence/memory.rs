use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use super::KeyValueStore;
use crate::utils::{StoreError, lock};

/// Volatile document store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    prefix: String,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Mutex::default(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn store(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}
