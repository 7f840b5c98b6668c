//! Common utilities and types shared across the Driftwood engine crates.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy, task identifiers and priorities, the backoff policy shared
//! by the sync queue and the realtime channel, and the listener list that backs
//! every `subscribe(callback)` surface.

pub mod error;
pub mod observer;
pub mod retry;
pub mod types;

pub use error::{Error, Result};
pub use observer::{Listeners, Subscription};
pub use retry::RetryConfig;
pub use types::{Priority, TaskId};
