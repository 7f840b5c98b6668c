//! Notification renderers.

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Presents a notification to the user. Implemented by the host.
pub trait NotificationRenderer: Send + Sync {
    fn notify(&self, title: &str, body: &str, metadata: &Map<String, Value>);
}

/// Renders notifications as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

impl NotificationRenderer for LogRenderer {
    fn notify(&self, title: &str, body: &str, metadata: &Map<String, Value>) {
        info!(target: "driftwood::notification", ?metadata, "{}: {}", title, body);
    }
}

/// A notification captured by [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedNotification {
    pub title: String,
    pub body: String,
    pub metadata: Map<String, Value>,
}

/// Keeps rendered notifications in memory. Clones share the same record.
#[derive(Debug, Default, Clone)]
pub struct RecordingRenderer {
    rendered: Arc<Mutex<Vec<RenderedNotification>>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered(&self) -> Vec<RenderedNotification> {
        self.rendered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl NotificationRenderer for RecordingRenderer {
    fn notify(&self, title: &str, body: &str, metadata: &Map<String, Value>) {
        self.rendered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RenderedNotification {
                title: title.to_string(),
                body: body.to_string(),
                metadata: metadata.clone(),
            });
    }
}
