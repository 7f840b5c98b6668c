//! Durable key-value storage for the Driftwood engine.
//!
//! This module provides a trait-based interface over the host's durable
//! key-value store and a registry for resolving a backend by name.
//!
//! # Design Principles
//! - Atomic per-key writes: a reader sees either the old or the new record
//! - Async operations: all I/O is async
//! - Opaque values: records are bytes, callers choose the encoding (JSON)
//! - Survives restarts: every backend except `memory` is durable

pub mod local;
pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::{KvStore, KvStoreExt};
