//! Topic dispatch for inbound messages.

use driftwood_common::{Listeners, Subscription};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::message::Envelope;

/// Routes envelopes to the handlers subscribed to their topic, or to the
/// unmatched handlers when a topic has none.
#[derive(Default)]
pub struct TopicRouter {
    topics: Mutex<HashMap<String, Listeners<Envelope>>>,
    unmatched: Listeners<Envelope>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Listeners<Envelope>>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle messages on `topic`. Handlers run in subscription order.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let listeners = self.topics().entry(topic.to_string()).or_default().clone();
        listeners.subscribe(handler)
    }

    /// Handle messages whose topic has no handlers.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe_unmatched<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.unmatched.subscribe(handler)
    }

    /// Deliver an envelope. Returns the number of handlers invoked.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let listeners = self.topics().get(&envelope.topic).cloned();
        let delivered = listeners.map_or(0, |listeners| listeners.emit(envelope));
        if delivered > 0 {
            return delivered;
        }
        self.unmatched.emit(envelope)
    }

    /// Topics with at least one live handler, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics()
            .iter()
            .filter(|(_, listeners)| !listeners.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }
}
