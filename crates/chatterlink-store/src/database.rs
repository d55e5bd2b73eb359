//! SQLite-backed key-value store.
//!
//! The [`SqliteStore`] owns a [`rusqlite::Connection`] behind a mutex and
//! guarantees that migrations are run before any other operation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::kv::{KeyValueStore, DEFAULT_NAMESPACE};
use crate::migrations;

#[derive(Clone)]
pub struct SqliteStore {
    namespace: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/chatterlink/chatterlink.db`
    /// - macOS:   `~/Library/Application Support/com.chatterlink.chatterlink/chatterlink.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\chatterlink\chatterlink\data\chatterlink.db`
    pub fn open_default() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "chatterlink", "chatterlink")
            .ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Self::open_at(&data_dir.join("chatterlink.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Handle over the same connection under another namespace.
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            conn: Arc::clone(&self.conn),
        }
    }

    /// Filesystem path of the open database, `None` when in memory.
    pub fn path(&self) -> Option<PathBuf> {
        let conn = self.conn.lock().ok()?;
        conn.path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

impl KeyValueStore for SqliteStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![self.full_key(key), value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![self.full_key(key)],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM kv WHERE key = ?1", params![self.full_key(key)])?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        // substr instead of LIKE: namespaces contain '_' wildcards
        let removed = self.conn()?.execute(
            "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
            params![self.namespace],
        )?;
        tracing::debug!(namespace = %self.namespace, removed, "cleared namespace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = SqliteStore::open_at(&path).expect("should open");
            assert!(store.path().is_some());
            store.set("dht_rooms", "[]").unwrap();
        }

        let reopened = SqliteStore::open_at(&path).unwrap();
        assert_eq!(reopened.get("dht_rooms").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn overwrite_and_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn clear_keeps_other_namespaces() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prefs = store.scoped("prefsXnamespace_");

        store.set("a", "1").unwrap();
        prefs.set("a", "2").unwrap();
        store.clear().unwrap();

        assert!(store.get("a").unwrap().is_none());
        assert_eq!(prefs.get("a").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn secure_values_expire() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.set_secure("tmp", "x", now + Duration::minutes(1)).unwrap();

        assert_eq!(store.get_secure("tmp", now).unwrap().as_deref(), Some("x"));
        assert!(store
            .get_secure("tmp", now + Duration::minutes(2))
            .unwrap()
            .is_none());
    }
}
