//! Turns engine events into filtered notifications.

use chrono::{Local, NaiveTime};
use driftwood_common::Subscription;
use driftwood_realtime::{ChannelEvent, ChannelManager};
use driftwood_sync::{QueueEvent, SyncQueue};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::preferences::PreferenceStore;
use crate::renderer::NotificationRenderer;

pub const CATEGORY_SYNC_FAILED: &str = "sync.failed";
pub const CATEGORY_SYNC_COMPLETED: &str = "sync.completed";
pub const CATEGORY_CONNECTION_DEGRADED: &str = "connection.degraded";

/// A notification candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub category: String,
    pub title: String,
    pub body: String,
    pub metadata: Map<String, Value>,
}

impl Notification {
    pub fn new(category: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            title: title.into(),
            body: body.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    CategoryDisabled,
    QuietHours,
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Delivered,
    Suppressed(SuppressReason),
}

/// Filters notifications against the current preferences and forwards
/// them to the renderer. Clones share preferences and renderer.
#[derive(Clone)]
pub struct NotificationDispatcher {
    preferences: Arc<PreferenceStore>,
    renderer: Arc<dyn NotificationRenderer>,
}

impl NotificationDispatcher {
    pub fn new(preferences: Arc<PreferenceStore>, renderer: Arc<dyn NotificationRenderer>) -> Self {
        Self {
            preferences,
            renderer,
        }
    }

    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    /// Dispatch against the local wall-clock time.
    pub fn dispatch(&self, notification: &Notification) -> Decision {
        self.dispatch_at(notification, Local::now().time())
    }

    /// Dispatch as if the local time were `time`.
    pub fn dispatch_at(&self, notification: &Notification, time: NaiveTime) -> Decision {
        let preferences = self.preferences.snapshot();

        let decision = if !preferences.is_enabled(&notification.category) {
            Decision::Suppressed(SuppressReason::CategoryDisabled)
        } else if preferences.is_quiet(time) {
            Decision::Suppressed(SuppressReason::QuietHours)
        } else {
            let mut metadata = notification.metadata.clone();
            metadata.insert("category".to_string(), json!(notification.category));
            self.renderer
                .notify(&notification.title, &notification.body, &metadata);
            Decision::Delivered
        };

        debug!(
            "Notification '{}' ({}): {:?}",
            notification.title, notification.category, decision
        );
        decision
    }

    /// Map a queue event to a notification. Only completions and final
    /// failures notify.
    pub fn queue_notification(event: &QueueEvent) -> Option<Notification> {
        match event {
            QueueEvent::Failed {
                id,
                kind,
                attempts,
                error,
            } => Some(
                Notification::new(
                    CATEGORY_SYNC_FAILED,
                    "Changes could not be synced",
                    format!("{} failed after {} attempts: {}", kind, attempts, error),
                )
                .with_metadata("task_id", json!(id.to_string()))
                .with_metadata("type", json!(kind)),
            ),
            QueueEvent::Completed { id, kind } => Some(
                Notification::new(
                    CATEGORY_SYNC_COMPLETED,
                    "Changes synced",
                    format!("{} completed", kind),
                )
                .with_metadata("task_id", json!(id.to_string()))
                .with_metadata("type", json!(kind)),
            ),
            _ => None,
        }
    }

    /// Map a channel event to a notification: server messages carrying a
    /// notification block, and the degraded signal.
    pub fn channel_notification(event: &ChannelEvent) -> Option<Notification> {
        match event {
            ChannelEvent::Message(envelope) => envelope.notification.as_ref().map(|hint| {
                let mut notification =
                    Notification::new(&hint.category, &hint.title, &hint.body);
                notification.metadata = hint.metadata.clone();
                notification.with_metadata("topic", json!(envelope.topic))
            }),
            ChannelEvent::Degraded { attempts } => Some(
                Notification::new(
                    CATEGORY_CONNECTION_DEGRADED,
                    "Live updates unavailable",
                    format!(
                        "Could not reach the server after {} attempts; still retrying",
                        attempts
                    ),
                )
                .with_metadata("attempts", json!(attempts)),
            ),
            ChannelEvent::StateChanged(_) => None,
        }
    }

    pub fn on_queue_event(&self, event: &QueueEvent) -> Option<Decision> {
        Self::queue_notification(event).map(|n| self.dispatch(&n))
    }

    pub fn on_channel_event(&self, event: &ChannelEvent) -> Option<Decision> {
        Self::channel_notification(event).map(|n| self.dispatch(&n))
    }

    /// Notify on `queue` events for as long as the subscription lives.
    #[must_use = "dropping the subscription detaches the dispatcher"]
    pub fn attach_queue(&self, queue: &SyncQueue) -> Subscription {
        let dispatcher = self.clone();
        queue.subscribe(move |event| {
            dispatcher.on_queue_event(event);
        })
    }

    /// Notify on `channel` events for as long as the subscription lives.
    #[must_use = "dropping the subscription detaches the dispatcher"]
    pub fn attach_channel(&self, channel: &ChannelManager) -> Subscription {
        let dispatcher = self.clone();
        channel.subscribe_events(move |event| {
            dispatcher.on_channel_event(event);
        })
    }
}
