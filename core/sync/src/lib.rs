//! Driftwood sync queue
//!
//! Durable queue of pending mutations against the backend:
//! - Typed operations dispatched through a strategy registry
//! - Priority bands with FIFO order inside each band
//! - Retry with exponential backoff and jitter
//! - Persistence across restarts
//! - Draining gated on the connection monitor

pub mod events;
pub mod operation;
pub mod queue;
pub mod task;

pub use events::QueueEvent;
pub use operation::{StrategyError, StrategyRegistry, StrategyResult, SyncOperation, SyncStrategy};
pub use queue::{EnqueueOptions, QueueConfig, SyncQueue};
pub use task::{task_key, SyncTask, TaskStatus, TASK_PREFIX};
