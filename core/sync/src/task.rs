//! Queued mutations and their lifecycle.

use chrono::{DateTime, Utc};
use driftwood_common::{Priority, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Key prefix of task records in the durable store.
pub const TASK_PREFIX: &str = "sync/task/";

/// Storage key of a task record.
pub fn task_key(id: &TaskId) -> String {
    format!("{}{}", TASK_PREFIX, id)
}

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting for its turn, possibly in backoff.
    Pending,
    /// A strategy invocation is running.
    InFlight,
    /// Retries exhausted or permanently rejected.
    Failed,
    /// Completed; removed from storage right after.
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in-flight",
            TaskStatus::Failed => "failed",
            TaskStatus::Done => "done",
        }
    }
}

/// A durable, queued mutation against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    /// Globally unique id, also the de-duplication key.
    pub id: TaskId,
    /// Strategy kind the payload is dispatched to.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Creation sequence; FIFO tiebreaker within a priority band.
    pub seq: u64,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: TaskStatus,
    /// Earliest time the next attempt may start.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Upper bound on a single strategy invocation.
    pub timeout_ms: u64,
    /// Cancelled while in flight; dropped once the attempt finishes.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl SyncTask {
    pub fn new(
        id: TaskId,
        kind: impl Into<String>,
        payload: Value,
        priority: Priority,
        seq: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
            priority,
            created_at: Utc::now(),
            seq,
            attempts: 0,
            last_error: None,
            status: TaskStatus::Pending,
            next_attempt_at: None,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            cancel_requested: false,
        }
    }

    /// Drain order key: priority band first, then creation order.
    pub fn drain_order(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }

    /// Whether the task may start an attempt at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Pending or in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InFlight)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Mark as running.
    pub fn mark_in_flight(&mut self) {
        self.status = TaskStatus::InFlight;
    }

    /// Record a failed attempt and schedule the next one after `delay`.
    pub fn mark_retrying(&mut self, error: impl Into<String>, delay: Duration) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.status = TaskStatus::Pending;
        self.next_attempt_at = Some(deadline_after(delay));
    }

    /// Record a final failed attempt.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.status = TaskStatus::Failed;
        self.next_attempt_at = None;
    }

    /// Put a failed task back in line with a fresh attempt budget.
    pub fn reset_for_retry(&mut self) {
        self.attempts = 0;
        self.status = TaskStatus::Pending;
        self.next_attempt_at = None;
    }

    /// Bring a task left in flight by a previous process back to pending.
    /// The interrupted attempt is not counted.
    pub fn recover(&mut self) {
        if self.status == TaskStatus::InFlight {
            self.status = TaskStatus::Pending;
        }
    }
}

fn deadline_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
