//! Capacity-bounded, TTL-aware cache mirrored to durable storage.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftwood_common::retry::RetryExecutor;
use driftwood_common::Result;
use driftwood_storage::KvStore;

use crate::entry::{CacheEntry, CacheValue};

/// Key prefix of cache records in the durable store.
pub const CACHE_PREFIX: &str = "cache/";

fn record_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

/// Configuration for the persistent cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on the summed `size_bytes` of all entries.
    pub budget_bytes: u64,
    /// TTL applied when `set` is called without one.
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 5 * 1024 * 1024,
            default_ttl: None,
        }
    }
}

/// Point-in-time cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

/// In-memory view. `order` lists insertions oldest first; records whose
/// sequence number no longer matches the live slot are skipped lazily.
#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    used_bytes: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    /// Insert an entry no larger than `budget`, evicting the oldest entries
    /// until it fits. Returns the evicted keys.
    fn insert(&mut self, entry: CacheEntry, budget: u64) -> Vec<String> {
        self.remove(&entry.key);

        let mut evicted = Vec::new();
        while self.used_bytes + entry.size_bytes > budget {
            let Some((seq, key)) = self.order.pop_front() else {
                break;
            };
            let live = self.entries.get(&key).is_some_and(|slot| slot.seq == seq);
            if live {
                self.remove(&key);
                evicted.push(key);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.used_bytes += entry.size_bytes;
        self.order.push_back((seq, entry.key.clone()));
        self.entries.insert(entry.key.clone(), Slot { entry, seq });
        self.compact();

        evicted
    }

    fn compact(&mut self) {
        if self.order.len() > self.entries.len() * 2 + 64 {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|slot| slot.seq == *seq));
        }
    }
}

enum PersistOp {
    Put(CacheEntry),
    Delete(String),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Background writer: applies persistence operations in submission order.
async fn run_writer(store: Arc<dyn KvStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    let executor = RetryExecutor::default();

    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Put(entry) => {
                let key = record_key(&entry.key);
                let bytes = match serde_json::to_vec(&entry) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to encode cache entry {}: {}", entry.key, e);
                        continue;
                    }
                };
                if let Err(e) = executor.execute(|| store.put(&key, bytes.clone())).await {
                    warn!("Failed to persist cache entry {}: {}", entry.key, e);
                }
            }
            PersistOp::Delete(key) => {
                let key = record_key(&key);
                if let Err(e) = executor.execute(|| store.delete(&key)).await {
                    warn!("Failed to delete cache record {}: {}", key, e);
                }
            }
            PersistOp::Clear => match store.list(CACHE_PREFIX).await {
                Ok(keys) => {
                    for key in keys {
                        if let Err(e) = store.delete(&key).await {
                            warn!("Failed to delete cache record {}: {}", key, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list cache records for clear: {}", e),
            },
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Cache writer stopped");
}

struct CacheInner {
    state: Mutex<CacheState>,
    config: CacheConfig,
    writer: mpsc::UnboundedSender<PersistOp>,
}

/// Persistent key/value cache with per-entry TTL and a byte budget.
///
/// Reads and writes are synchronous against the in-memory view; durable
/// writes are queued to a background writer so `get` right after `set`
/// always observes the new value. Clones share the same cache.
#[derive(Clone)]
pub struct PersistentCache {
    inner: Arc<CacheInner>,
}

impl PersistentCache {
    /// Open the cache over `store`, restoring unexpired entries.
    ///
    /// Expired, unreadable and over-budget records are deleted from the
    /// store while loading. Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// - Listing or reading the store fails
    pub async fn open(store: Arc<dyn KvStore>, config: CacheConfig) -> Result<Self> {
        let records = store.load_prefix(CACHE_PREFIX).await?;
        let now = Utc::now();

        let mut live = Vec::new();
        let mut stale = Vec::new();
        for (key, bytes) in records {
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) if record_key(&entry.key) == key && !entry.is_expired(now) => {
                    live.push(entry)
                }
                Ok(_) => stale.push(key),
                Err(e) => {
                    warn!("Dropping unreadable cache record {}: {}", key, e);
                    stale.push(key);
                }
            }
        }

        live.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut state = CacheState::default();
        for mut entry in live {
            entry.size_bytes = entry.key.len() as u64 + entry.value.encoded_len();
            if entry.size_bytes > config.budget_bytes {
                stale.push(record_key(&entry.key));
                continue;
            }
            for key in state.insert(entry, config.budget_bytes) {
                stale.push(record_key(&key));
            }
        }

        for key in &stale {
            if let Err(e) = store.delete(key).await {
                warn!("Failed to delete stale cache record {}: {}", key, e);
            }
        }

        info!(
            "Cache opened on {} store: {} entries, {} bytes ({} stale records dropped)",
            store.name(),
            state.entries.len(),
            state.used_bytes,
            stale.len()
        );

        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, rx));

        Ok(Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(state),
                config,
                writer,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, op: PersistOp) {
        if self.inner.writer.send(op).is_err() {
            debug!("Cache writer is gone; skipping durable write");
        }
    }

    /// Read a value. Returns `None` on miss or expiry; expired entries are
    /// purged on the way.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let mut state = self.state();
        let expired = state.entries.get(key)?.entry.is_expired(Utc::now());

        if expired {
            state.remove(key);
            self.persist(PersistOp::Delete(key.to_string()));
            debug!("Cache entry {} expired", key);
            return None;
        }

        state.entries.get(key).map(|slot| slot.entry.value.clone())
    }

    /// Read and decode a JSON value. Returns `None` on miss, expiry, a bytes
    /// entry, or a shape mismatch.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.get(key)? {
            CacheValue::Json(value) => value,
            CacheValue::Bytes(_) => return None,
        };
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!("Cache entry {} has an unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Write a value, replacing any previous entry and resetting its TTL.
    ///
    /// `ttl` of `None` falls back to the configured default TTL. Entries are
    /// evicted oldest-first to make room; an entry larger than the whole
    /// budget is rejected and any previous value for the key is dropped.
    pub fn set(&self, key: impl Into<String>, value: impl Into<CacheValue>, ttl: Option<Duration>) {
        let ttl_ms = ttl
            .or(self.inner.config.default_ttl)
            .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        let entry = CacheEntry::new(key, value.into(), ttl_ms);
        let budget = self.inner.config.budget_bytes;

        let mut state = self.state();
        if entry.size_bytes > budget {
            warn!(
                "Rejecting cache entry {}: {} bytes exceeds the {} byte budget",
                entry.key, entry.size_bytes, budget
            );
            if state.remove(&entry.key).is_some() {
                self.persist(PersistOp::Delete(entry.key));
            }
            return;
        }

        for evicted in state.insert(entry.clone(), budget) {
            debug!("Evicted cache entry {}", evicted);
            self.persist(PersistOp::Delete(evicted));
        }
        self.persist(PersistOp::Put(entry));
    }

    /// Encode and write a JSON value.
    ///
    /// # Errors
    /// - `value` cannot be represented as JSON
    pub fn set_json<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, CacheValue::Json(value), ttl);
        Ok(())
    }

    /// Remove an entry. Returns whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.state();
        let removed = state.remove(key).is_some();
        if removed {
            self.persist(PersistOp::Delete(key.to_string()));
        }
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut state = self.state();
        *state = CacheState::default();
        self.persist(PersistOp::Clear);
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|slot| slot.entry.is_expired(now))
            .map(|slot| slot.entry.key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
            self.persist(PersistOp::Delete(key.clone()));
        }

        if !expired.is_empty() {
            debug!("Swept {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Keys of all unexpired entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Utc::now();
        let state = self.state();
        let mut keys: Vec<String> = state
            .entries
            .values()
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Current occupancy.
    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            budget_bytes: self.inner.config.budget_bytes,
        }
    }

    /// Wait until every write issued so far has reached the store.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.persist(PersistOp::Flush(done));
        let _ = wait.await;
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }
}
