//! # State Store
//!
//! Durable key-value persistence behind a trait so the backend is injected
//! rather than an implicit filesystem side effect. Production runs use the
//! bundled SQLite backend; tests may use the in-memory backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store poisoned: {0}")]
    Poisoned(String),
}

/// Durable keyspace partitioned into buckets. One record per (bucket, key).
pub trait StateStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
    fn scan(&self, bucket: &str) -> Result<Vec<(String, String)>, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS state (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (bucket, key)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl StateStore for SqliteStore {
    fn put(&self, bucket: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO state (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, value],
        )?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM state WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM state WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(())
    }

    fn scan(&self, bucket: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM state WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![bucket], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// In-memory backend for tests and dry runs. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl StateStore for MemoryStore {
    fn put(&self, bucket: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?
            .insert((bucket.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn scan(&self, bucket: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_round_trips_values() {
        let store = SqliteStore::open_in_memory().expect("store");
        store.put("jobs", "a", "{\"x\":1}").expect("put");
        store.put("jobs", "a", "{\"x\":2}").expect("overwrite");
        assert_eq!(
            store.get("jobs", "a").expect("get"),
            Some("{\"x\":2}".to_string())
        );
        store.delete("jobs", "a").expect("delete");
        assert_eq!(store.get("jobs", "a").expect("get"), None);
    }

    #[test]
    fn scan_is_scoped_to_bucket() {
        let store = SqliteStore::open_in_memory().expect("store");
        store.put("jobs", "a", "1").expect("put");
        store.put("deferrals", "a", "2").expect("put");
        store.put("jobs", "b", "3").expect("put");
        let rows = store.scan("jobs").expect("scan");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].0, "b");
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).expect("store");
            store.put("jobs", "a", "1").expect("put");
        }
        let store = SqliteStore::open(&path).expect("reopen");
        assert_eq!(store.get("jobs", "a").expect("get"), Some("1".to_string()));
    }

    #[test]
    fn memory_store_behaves_like_sqlite() {
        let store = MemoryStore::new();
        store.put("jobs", "a", "1").expect("put");
        assert_eq!(store.get("jobs", "a").expect("get"), Some("1".to_string()));
        assert_eq!(store.get("jobs", "b").expect("get"), None);
    }
}
