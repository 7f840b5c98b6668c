//! Local filesystem key-value store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::store::{validate_key, KvStore};
use driftwood_common::{Error, Result};

/// Characters kept verbatim in record file names. Everything else,
/// including `.` and `/`, is percent-encoded so a key maps to exactly one
/// flat file name.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Longest file name common filesystems accept.
const MAX_FILE_NAME_BYTES: usize = 255;

/// Directory (inside the root) used for in-progress writes.
const STAGING_DIR: &str = ".staging";

/// Local filesystem key-value store.
///
/// Stores one file per key under a root directory. Writes go to a staging
/// file first and are renamed into place, which keeps per-key writes atomic.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root and staging directories exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Constructor is sync; directory creation is a one-off
        std::fs::create_dir_all(root.join(STAGING_DIR))?;

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(key: &str) -> String {
        utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
    }

    /// Path of the record file for `key`.
    ///
    /// # Errors
    /// - Empty key
    /// - Key whose encoded file name exceeds the filesystem limit
    fn record_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let name = Self::file_name(key);
        if name.len() > MAX_FILE_NAME_BYTES {
            return Err(Error::InvalidInput(format!(
                "Store key is too long for a local file name ({} bytes encoded, max {})",
                name.len(),
                MAX_FILE_NAME_BYTES
            )));
        }
        Ok(self.root.join(name))
    }

    fn decode_file_name(name: &str) -> Option<String> {
        percent_decode_str(name)
            .decode_utf8()
            .ok()
            .map(|key| key.into_owned())
    }
}

#[async_trait]
impl KvStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key)?;
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.record_path(key)?;
        let staging_file = self
            .root
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());

        fs::write(&staging_file, &value).await?;
        if let Err(e) = fs::rename(&staging_file, &path).await {
            let _ = fs::remove_file(&staging_file).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.record_path(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match Self::decode_file_name(name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => warn!("Skipping undecodable record file: {}", name),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_put_get() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.put("cache/user:42", b"{}".to_vec()).await.unwrap();
        assert_eq!(
            store.get("cache/user:42").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert!(store.get("cache/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = LocalStore::new(temp.path()).unwrap();
            store.put("sync/task/1", b"task".to_vec()).await.unwrap();
        }

        let reopened = LocalStore::new(temp.path()).unwrap();
        assert_eq!(
            reopened.get("sync/task/1").await.unwrap(),
            Some(b"task".to_vec())
        );
    }

    #[tokio::test]
    async fn test_local_list_decodes_keys() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.put("sync/task/b", vec![]).await.unwrap();
        store.put("sync/task/a", vec![]).await.unwrap();
        store.put(".staging", vec![]).await.unwrap();

        let keys = store.list("sync/").await.unwrap();
        assert_eq!(keys, vec!["sync/task/a", "sync/task/b"]);

        let all = store.list("").await.unwrap();
        assert!(all.contains(&".staging".to_string()));
    }

    #[tokio::test]
    async fn test_local_delete() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.put("k", vec![1]).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_rejects_key_too_long_for_file_name() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        // Each '/' encodes to three bytes, so 100 of them overflow a file name.
        let long_key = "/".repeat(100);
        assert!(matches!(
            store.put(&long_key, vec![1]).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.get(&long_key).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store.delete(&long_key).await,
            Err(Error::InvalidInput(_))
        ));

        let fitting_key = "a".repeat(MAX_FILE_NAME_BYTES);
        store.put(&fitting_key, vec![2]).await.unwrap();
        assert_eq!(store.get(&fitting_key).await.unwrap(), Some(vec![2]));
    }
}
