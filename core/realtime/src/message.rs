//! Wire frames exchanged over the channel.

use driftwood_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Notification block a server may attach to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationHint {
    pub category: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// A topic-addressed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationHint>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            notification: None,
        }
    }

    pub fn with_notification(mut self, hint: NotificationHint) -> Self {
        self.notification = Some(hint);
        self
    }
}

/// A JSON text frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Message(Envelope),
    Ping { id: u64 },
    Pong { id: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
