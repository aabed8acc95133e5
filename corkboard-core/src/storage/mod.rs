pub mod local;
pub mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Abstract durable key/value storage for client-side state.
/// Implementations: FileStore (one JSON file per key), MemoryStore (tests).
pub trait KeyValueStore: Send + Sync {
    /// Read the raw value for a key. `Ok(None)` when the key was never written.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Durably replace the value for a key.
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Move a value to another key (used to set aside unreadable data).
    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        if let Some(value) = self.get(from)? {
            self.put(to, &value)?;
            self.remove(from)?;
        }
        Ok(())
    }
}

/// Deserialize a JSON value stored under `key`.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Serialize `value` as JSON under `key`.
pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string_pretty(value)?;
    store.put(key, &raw)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Corrupt data under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
