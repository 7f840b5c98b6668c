//! Events published by the sync queue.

use driftwood_common::{Priority, TaskId};
use std::time::Duration;

/// A change in the sync queue, delivered to `SyncQueue::subscribe` listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        id: TaskId,
        kind: String,
        priority: Priority,
    },
    Started {
        id: TaskId,
        kind: String,
        attempt: u32,
    },
    Completed {
        id: TaskId,
        kind: String,
    },
    /// An attempt failed and the task is back in line after `delay`.
    Retrying {
        id: TaskId,
        kind: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The task exhausted its attempts or was permanently rejected.
    Failed {
        id: TaskId,
        kind: String,
        attempts: u32,
        error: String,
    },
    Cancelled {
        id: TaskId,
        kind: String,
    },
    /// Number of pending and in-flight tasks changed.
    PendingChanged {
        count: usize,
    },
}

impl QueueEvent {
    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            QueueEvent::Enqueued { id, .. }
            | QueueEvent::Started { id, .. }
            | QueueEvent::Completed { id, .. }
            | QueueEvent::Retrying { id, .. }
            | QueueEvent::Failed { id, .. }
            | QueueEvent::Cancelled { id, .. } => Some(*id),
            QueueEvent::PendingChanged { .. } => None,
        }
    }
}
