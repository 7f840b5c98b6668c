//! In-memory key-value store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::{validate_key, KvStore};
use driftwood_common::{Error, Result};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail with a storage error.
    ///
    /// Lets tests exercise the engine's behavior when the host store is
    /// unavailable.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store is read-only".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> Error {
        Error::Storage("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        Ok(records.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let store = MemoryStore::new();

        store.put("k", b"v1".to_vec()).await.unwrap();
        store.put("k", b"v2".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_list_prefix_sorted() {
        let store = MemoryStore::new();
        store.put("sync/task/b", vec![]).await.unwrap();
        store.put("sync/task/a", vec![]).await.unwrap();
        store.put("cache/x", vec![]).await.unwrap();

        let keys = store.list("sync/task/").await.unwrap();
        assert_eq!(keys, vec!["sync/task/a", "sync/task/b"]);
    }

    #[tokio::test]
    async fn test_memory_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.put("k", vec![1]).await.is_err());

        store.set_fail_writes(false);
        store.put("k", vec![1]).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.put("k", vec![1]).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some(vec![1]));
    }
}
