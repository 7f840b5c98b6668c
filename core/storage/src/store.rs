//! Key-value store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use driftwood_common::{Error, Result};

/// Durable key-value store provided by the host environment.
///
/// Keys are arbitrary non-empty strings; components namespace them with a
/// prefix such as `cache/` or `sync/task/`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local", "sqlite").
    fn name(&self) -> &str;

    /// Read a record.
    ///
    /// # Returns
    /// `None` if no record is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a record, replacing any previous value atomically.
    ///
    /// # Postconditions
    /// - A subsequent `get` (also after restart, for durable backends) returns `value`
    ///
    /// # Errors
    /// - Empty key
    /// - Backend I/O errors
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a record. Returns whether a record existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List keys starting with `prefix`, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Load every record under `prefix`.
    async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut records = Vec::new();
        for key in self.list(prefix).await? {
            if let Some(value) = self.get(&key).await? {
                records.push((key, value));
            }
        }
        Ok(records)
    }
}

/// JSON helpers available on every store.
#[async_trait]
pub trait KvStoreExt: KvStore {
    /// Read and decode a JSON record.
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON record.
    async fn put_json<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Reject keys no backend can store.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Store key cannot be empty".to_string()));
    }
    Ok(())
}
