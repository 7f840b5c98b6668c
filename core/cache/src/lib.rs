//! Persistent cache for the Driftwood engine.
//!
//! The cache is the single read path for UI components: it answers reads from
//! memory immediately, mirrors every write to the durable store in the
//! background, expires entries by TTL, and keeps its total size within a byte
//! budget by evicting the oldest entries first.

pub mod cache;
pub mod entry;

pub use cache::{CacheConfig, CacheStats, PersistentCache, CACHE_PREFIX};
pub use entry::{CacheEntry, CacheValue};
