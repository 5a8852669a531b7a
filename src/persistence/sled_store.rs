use serde_json::Value;
use sled::Db;

use super::KeyValueStore;
use crate::config::StorageSettings;
use crate::utils::StoreError;

/// On-disk document store backed by an embedded `sled` database.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    prefix: String,
}

impl SledStore {
    pub fn open(path: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            prefix: prefix.into(),
        })
    }

    pub fn from_settings(settings: &StorageSettings) -> Result<Self, StoreError> {
        Self::open(&settings.path, settings.key_prefix.clone())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(value)?;
        self.db.insert(key, serialized)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.db
            .iter()
            .keys()
            .map(|key| -> Result<String, StoreError> {
                let key = key?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("prefix", &self.prefix)
            .finish()
    }
}
