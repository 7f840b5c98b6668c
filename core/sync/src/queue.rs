//! Durable, priority-ordered queue of pending mutations.

use chrono::Utc;
use driftwood_common::{Error, Listeners, Priority, Result, RetryConfig, Subscription, TaskId};
use driftwood_connectivity::ConnectionMonitor;
use driftwood_storage::{KvStore, KvStoreExt};
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::QueueEvent;
use crate::operation::{StrategyError, StrategyRegistry, SyncOperation};
use crate::task::{task_key, SyncTask, TaskStatus, TASK_PREFIX};

/// Sync queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Backoff policy; `max_attempts` is the attempt budget per task.
    pub retry: RetryConfig,
    /// Strategy timeout for tasks enqueued without one.
    pub default_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::new(5),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Options for [`SyncQueue::enqueue_with`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Caller-chosen id; enqueuing an id that is already queued is a no-op.
    pub id: Option<TaskId>,
    pub priority: Priority,
    /// Per-invocation strategy timeout.
    pub timeout: Option<Duration>,
}

struct QueueState {
    tasks: HashMap<TaskId, SyncTask>,
    /// Ids whose first record is being written; duplicates return early.
    enqueuing: HashSet<TaskId>,
    next_seq: u64,
}

impl QueueState {
    fn pending_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_pending()).count()
    }
}

enum Failure {
    Retrying(SyncTask, Duration),
    Failed(SyncTask),
    Cancelled(SyncTask),
}

struct QueueInner {
    store: Arc<dyn KvStore>,
    strategies: StrategyRegistry,
    monitor: ConnectionMonitor,
    config: QueueConfig,
    state: Mutex<QueueState>,
    listeners: Listeners<QueueEvent>,
    drain_gate: tokio::sync::Mutex<()>,
    wake: Notify,
}

/// Offline-first mutation queue.
///
/// Tasks are persisted before they become visible, drained one at a time
/// in priority order while the monitor reports online, and retried with
/// backoff until they succeed or exhaust their attempts. Clones share the
/// same queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl SyncQueue {
    /// Open the queue over `store`, restoring persisted tasks.
    ///
    /// Tasks left in flight by a previous process go back to pending
    /// without counting the interrupted attempt.
    ///
    /// # Errors
    /// - Reading or rewriting task records fails
    pub async fn open(
        store: Arc<dyn KvStore>,
        strategies: StrategyRegistry,
        monitor: ConnectionMonitor,
        config: QueueConfig,
    ) -> Result<Self> {
        let mut tasks = HashMap::new();
        let mut next_seq = 0;
        let mut recovered = 0;

        for (key, bytes) in store.load_prefix(TASK_PREFIX).await? {
            let mut task: SyncTask = match serde_json::from_slice(&bytes) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Skipping unreadable task record {}: {}", key, e);
                    continue;
                }
            };

            let interrupted = task.status == TaskStatus::InFlight;
            if task.status == TaskStatus::Done || (interrupted && task.cancel_requested) {
                store.delete(&key).await?;
                continue;
            }
            if interrupted {
                task.recover();
                store.put_json(&key, &task).await?;
                recovered += 1;
            }
            if !strategies.contains(&task.kind) {
                warn!("Restored task {} has no strategy for '{}'", task.id, task.kind);
            }

            next_seq = next_seq.max(task.seq + 1);
            tasks.insert(task.id, task);
        }

        info!(
            "Sync queue opened on {} store: {} tasks ({} recovered from in-flight)",
            store.name(),
            tasks.len(),
            recovered
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                strategies,
                monitor,
                config,
                state: Mutex::new(QueueState {
                    tasks,
                    enqueuing: HashSet::new(),
                    next_seq,
                }),
                listeners: Listeners::new(),
                drain_gate: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        self.inner.listeners.emit(&event);
    }

    fn emit_pending(&self) {
        let count = self.lock().pending_count();
        self.emit(QueueEvent::PendingChanged { count });
    }

    async fn persist(&self, task: &SyncTask) {
        if let Err(e) = self.inner.store.put_json(&task_key(&task.id), task).await {
            warn!("Failed to persist task {}: {}", task.id, e);
        }
    }

    async fn forget(&self, id: &TaskId) {
        if let Err(e) = self.inner.store.delete(&task_key(id)).await {
            warn!("Failed to delete task record {}: {}", id, e);
        }
    }

    /// Receive queue events.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(callback)
    }

    /// Queue an untyped task.
    ///
    /// # Errors
    /// - No strategy is registered for `kind`
    /// - The task cannot be persisted
    pub async fn enqueue(&self, kind: &str, payload: Value, priority: Priority) -> Result<TaskId> {
        self.enqueue_with(
            kind,
            payload,
            EnqueueOptions {
                priority,
                ..EnqueueOptions::default()
            },
        )
        .await
    }

    /// Validate and queue a typed operation.
    ///
    /// # Errors
    /// - `op` fails validation
    /// - No strategy is registered for `O::KIND`
    /// - The task cannot be persisted
    pub async fn enqueue_op<O: SyncOperation>(&self, op: &O, priority: Priority) -> Result<TaskId> {
        op.validate()?;
        let payload = serde_json::to_value(op)?;
        self.enqueue(O::KIND, payload, priority).await
    }

    /// Queue a task with explicit options.
    ///
    /// The task is durable before it becomes visible to the drain. If
    /// `options.id` is already queued, nothing changes and the id is
    /// returned.
    ///
    /// # Errors
    /// - No strategy is registered for `kind`
    /// - The task cannot be persisted
    pub async fn enqueue_with(
        &self,
        kind: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<TaskId> {
        if !self.inner.strategies.contains(kind) {
            return Err(Error::InvalidInput(format!(
                "No strategy registered for task type '{}'",
                kind
            )));
        }

        let id = options.id.unwrap_or_default();
        let task = {
            let mut state = self.lock();
            if state.tasks.contains_key(&id) || !state.enqueuing.insert(id) {
                debug!("Task {} is already queued", id);
                return Ok(id);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            SyncTask::new(
                id,
                kind,
                payload,
                options.priority,
                seq,
                options.timeout.unwrap_or(self.inner.config.default_timeout),
            )
        };

        let written = self.inner.store.put_json(&task_key(&id), &task).await;

        {
            let mut state = self.lock();
            state.enqueuing.remove(&id);
            written?;
            state.tasks.insert(id, task);
        }

        debug!("Enqueued task {} ({}, {})", id, kind, options.priority);
        self.emit(QueueEvent::Enqueued {
            id,
            kind: kind.to_string(),
            priority: options.priority,
        });
        self.emit_pending();
        self.inner.wake.notify_one();

        Ok(id)
    }

    /// Pending and in-flight tasks, in drain order.
    pub fn get_pending(&self) -> Vec<SyncTask> {
        let mut tasks: Vec<SyncTask> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.is_pending())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.drain_order());
        tasks
    }

    /// Every retained task, including failed ones, in drain order.
    pub fn tasks(&self) -> Vec<SyncTask> {
        let mut tasks: Vec<SyncTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.drain_order());
        tasks
    }

    /// Tasks that exhausted their attempts or were rejected.
    pub fn failed(&self) -> Vec<SyncTask> {
        let mut tasks: Vec<SyncTask> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.drain_order());
        tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<SyncTask> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_count()
    }

    /// Cancel a task. Returns false for unknown ids.
    ///
    /// A pending or failed task is removed immediately. An in-flight task
    /// finishes its current attempt and is removed afterwards, without a
    /// retry.
    pub async fn cancel(&self, id: &TaskId) -> bool {
        let (removed, deferred) = {
            let mut state = self.lock();
            let Some(status) = state.tasks.get(id).map(|t| t.status) else {
                return false;
            };
            if status == TaskStatus::InFlight {
                let deferred = state.tasks.get_mut(id).map(|task| {
                    task.cancel_requested = true;
                    task.clone()
                });
                (None, deferred)
            } else {
                (state.tasks.remove(id), None)
            }
        };

        if let Some(task) = deferred {
            debug!("Task {} is in flight; cancelling after this attempt", id);
            self.persist(&task).await;
            return true;
        }

        if let Some(task) = removed {
            self.forget(id).await;
            info!("Cancelled task {} ({})", id, task.kind);
            self.emit(QueueEvent::Cancelled {
                id: *id,
                kind: task.kind,
            });
            self.emit_pending();
        }
        true
    }

    /// Put a failed task back in line with a fresh attempt budget.
    /// Returns false when the task is unknown or not failed.
    ///
    /// # Errors
    /// - The task cannot be persisted
    pub async fn retry(&self, id: &TaskId) -> Result<bool> {
        let task = {
            let mut state = self.lock();
            match state.tasks.get_mut(id) {
                Some(task) if task.status == TaskStatus::Failed => {
                    task.reset_for_retry();
                    task.clone()
                }
                _ => return Ok(false),
            }
        };

        self.inner.store.put_json(&task_key(id), &task).await?;
        info!("Task {} ({}) queued for manual retry", id, task.kind);
        self.emit(QueueEvent::Enqueued {
            id: *id,
            kind: task.kind,
            priority: task.priority,
        });
        self.emit_pending();
        self.inner.wake.notify_one();
        Ok(true)
    }

    /// Drain eligible tasks while online. Returns the number of strategy
    /// invocations made.
    ///
    /// Only one drain runs at a time: a flush issued during a drain waits
    /// for it to finish and returns 0.
    pub async fn flush(&self) -> usize {
        match self.inner.drain_gate.try_lock() {
            Ok(_gate) => self.drain().await,
            Err(_) => {
                debug!("Drain already running; waiting for it");
                let _gate = self.inner.drain_gate.lock().await;
                0
            }
        }
    }

    async fn drain(&self) -> usize {
        let mut invoked = 0;
        loop {
            if !self.inner.monitor.is_online() {
                debug!("Offline; drain paused");
                break;
            }
            let Some(task) = self.claim_next() else {
                break;
            };
            self.persist(&task).await;
            self.run_attempt(task).await;
            invoked += 1;
        }
        if invoked > 0 {
            debug!("Drain finished after {} invocations", invoked);
        }
        invoked
    }

    fn claim_next(&self) -> Option<SyncTask> {
        let now = Utc::now();
        let mut state = self.lock();
        let id = state
            .tasks
            .values()
            .filter(|t| t.is_eligible(now))
            .min_by_key(|t| t.drain_order())
            .map(|t| t.id)?;
        let task = state.tasks.get_mut(&id)?;
        task.mark_in_flight();
        Some(task.clone())
    }

    async fn run_attempt(&self, task: SyncTask) {
        let attempt = task.attempts + 1;
        debug!("Running task {} ({}) attempt {}", task.id, task.kind, attempt);
        self.emit(QueueEvent::Started {
            id: task.id,
            kind: task.kind.clone(),
            attempt,
        });

        let timeout = task.timeout();
        let invocation = AssertUnwindSafe(
            self.inner
                .strategies
                .invoke(&task.kind, task.payload.clone()),
        )
        .catch_unwind();

        let outcome = match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StrategyError::transient("Strategy panicked")),
            Err(_) => Err(StrategyError::transient(format!(
                "Strategy timed out after {:?}",
                timeout
            ))),
        };

        match outcome {
            Ok(()) => self.complete(task).await,
            Err(e) => self.record_failure(task, e).await,
        }
    }

    async fn complete(&self, task: SyncTask) {
        self.lock().tasks.remove(&task.id);
        self.forget(&task.id).await;

        info!("Task {} ({}) completed", task.id, task.kind);
        self.emit(QueueEvent::Completed {
            id: task.id,
            kind: task.kind,
        });
        self.emit_pending();
    }

    async fn record_failure(&self, task: SyncTask, failure: StrategyError) {
        let retry = &self.inner.config.retry;
        let outcome = {
            let mut state = self.lock();
            let Some(current) = state.tasks.get_mut(&task.id) else {
                return;
            };

            if current.cancel_requested {
                state.tasks.remove(&task.id).map(Failure::Cancelled)
            } else if !failure.retryable || current.attempts + 1 >= retry.max_attempts {
                current.mark_failed(failure.message.clone());
                Some(Failure::Failed(current.clone()))
            } else {
                let delay = retry.delay_for_attempt(current.attempts);
                current.mark_retrying(failure.message.clone(), delay);
                Some(Failure::Retrying(current.clone(), delay))
            }
        };

        match outcome {
            Some(Failure::Retrying(task, delay)) => {
                self.persist(&task).await;
                warn!(
                    "Task {} ({}) attempt {} failed: {}; retrying in {:?}",
                    task.id, task.kind, task.attempts, failure, delay
                );
                self.emit(QueueEvent::Retrying {
                    id: task.id,
                    kind: task.kind,
                    attempt: task.attempts,
                    delay,
                    error: failure.message,
                });
            }
            Some(Failure::Failed(task)) => {
                self.persist(&task).await;
                error!(
                    "Task {} ({}) failed after {} attempts: {}",
                    task.id, task.kind, task.attempts, failure
                );
                self.emit(QueueEvent::Failed {
                    id: task.id,
                    kind: task.kind,
                    attempts: task.attempts,
                    error: failure.message,
                });
                self.emit_pending();
            }
            Some(Failure::Cancelled(task)) => {
                self.forget(&task.id).await;
                info!("Cancelled task {} ({}) after its attempt", task.id, task.kind);
                self.emit(QueueEvent::Cancelled {
                    id: task.id,
                    kind: task.kind,
                });
                self.emit_pending();
            }
            None => {}
        }
    }

    fn next_deadline(&self) -> Option<Duration> {
        let now = Utc::now();
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| t.next_attempt_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Drain in the background whenever the monitor comes online, a task
    /// is queued, or a backoff deadline passes, until `cancel` fires.
    pub fn spawn_worker(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.run_worker(cancel).await })
    }

    async fn run_worker(&self, cancel: CancellationToken) {
        let mut online = self.inner.monitor.watch_online();
        info!("Sync worker started");

        loop {
            online.mark_unchanged();
            if self.inner.monitor.is_online() {
                self.flush().await;
            }

            let next = if self.inner.monitor.is_online() {
                self.next_deadline()
            } else {
                None
            };
            let backoff = async move {
                match next {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = backoff => {}
            }
        }

        info!("Sync worker stopped");
    }
}
