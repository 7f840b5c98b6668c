//! Driftwood engine bootstrap
//!
//! Loads [`EngineConfig`] and wires one instance of every component into
//! an [`Engine`]: storage, cache, connection monitor, sync queue, realtime
//! channel and notification dispatcher.

pub mod config;
pub mod engine;

pub use config::{
    CacheSection, ConnectivitySection, EngineConfig, QueueSection, RealtimeSection,
    StorageSection,
};
pub use engine::{Engine, EngineBuilder, EngineStatus, TOPIC_CACHE_PREFIX};
