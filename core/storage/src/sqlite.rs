//! SQLite-backed key-value store.
//!
//! Persists records in a single table for hosts that prefer one database
//! file over a directory of records.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::store::{validate_key, KvStore};
use driftwood_common::{Error, Result};

/// SQLite key-value store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sqlite_error)?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_records (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_error)?;

        info!("SQLite store opened successfully");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a statement on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
            f(&*conn).map_err(sqlite_error)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {}", e)))?
    }
}

fn sqlite_error(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

#[async_trait]
impl KvStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_records WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        })
        .await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        let now = unix_now();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv_records (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_records WHERE key = ?1", params![key])
                .map(|changed| changed > 0)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_records WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
        .await
    }
}

/// Seconds since the Unix epoch, for the `updated_at` column.
fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_put_get_delete() {
        let store = SqliteStore::in_memory().unwrap();

        store.put("cache/a", b"1".to_vec()).await.unwrap();
        store.put("cache/a", b"2".to_vec()).await.unwrap();
        assert_eq!(store.get("cache/a").await.unwrap(), Some(b"2".to_vec()));

        assert!(store.delete("cache/a").await.unwrap());
        assert!(store.get("cache/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_list_prefix() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("sync/task/2", vec![]).await.unwrap();
        store.put("sync/task/1", vec![]).await.unwrap();
        store.put("sync/other", vec![]).await.unwrap();
        store.put("cache/%", vec![]).await.unwrap();

        let keys = store.list("sync/task/").await.unwrap();
        assert_eq!(keys, vec!["sync/task/1", "sync/task/2"]);
        assert_eq!(store.list("cache/%").await.unwrap(), vec!["cache/%"]);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("k", b"durable".to_vec()).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(b"durable".to_vec()));
    }
}
