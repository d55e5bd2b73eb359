//! Namespaced key-value storage.
//!
//! Keys are stored as `<namespace><key>`, so several logical stores can share
//! one backend and [`KeyValueStore::clear`] only wipes its own namespace.
//! Secure entries wrap the value with an absolute expiry and disappear on the
//! first read past it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Default namespace for application keys.
pub const DEFAULT_NAMESPACE: &str = "chatterlink_";

pub trait KeyValueStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key in this store's namespace.
    fn clear(&self) -> Result<()>;

    fn set_secure(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let entry = SecureEntry {
            value: value.to_string(),
            timestamp: Utc::now(),
            expires_at,
        };
        self.set(key, &serde_json::to_string(&entry)?)
    }

    /// Returns `None` once `now` has reached the entry's expiry, removing it.
    fn get_secure(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        let entry: SecureEntry = serde_json::from_str(&raw)?;
        if now >= entry.expires_at {
            tracing::debug!(key, "secure entry expired");
            self.remove(key)?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }
}

impl dyn KeyValueStore {
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecureEntry {
    value: String,
    timestamp: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-process store. Handles created with [`MemoryStore::scoped`] share the
/// same entries under a different namespace.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    namespace: String,
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            entries: Arc::clone(&self.entries),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(self.full_key(key), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(&self.full_key(key)).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(&self.full_key(key));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let ns = self.namespace.clone();
        self.lock()?.retain(|k, _| !k.starts_with(&ns));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_get_remove() {
        let store = MemoryStore::new();
        store.set("theme", "dark").unwrap();
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("dark"));

        store.remove("theme").unwrap();
        assert!(store.get("theme").unwrap().is_none());
    }

    #[test]
    fn test_clear_is_namespace_scoped() {
        let app = MemoryStore::new();
        let other = app.scoped("other_");

        app.set("a", "1").unwrap();
        other.set("a", "2").unwrap();

        app.clear().unwrap();
        assert!(app.get("a").unwrap().is_none());
        assert_eq!(other.get("a").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_secure_entry_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .set_secure("session", "token", now + Duration::seconds(30))
            .unwrap();

        assert_eq!(
            store.get_secure("session", now).unwrap().as_deref(),
            Some("token")
        );
        assert!(store
            .get_secure("session", now + Duration::seconds(31))
            .unwrap()
            .is_none());
        // removed on the expired read
        assert!(store.get("session").unwrap().is_none());
    }

    #[test]
    fn test_json_helpers() {
        let store: Box<dyn KeyValueStore> = Box::new(MemoryStore::new());
        store.set_json("list", &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = store.get_json("list").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(store.get_json::<Vec<u32>>("missing").unwrap().is_none());
    }
}
