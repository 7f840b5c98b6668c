//! Stabilization of a flapping boolean signal.

use std::time::Duration;
use tokio::time::Instant;

/// Commits a new value only after it has been observed continuously for
/// the stabilization window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    stable: bool,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(initial: bool, window: Duration) -> Self {
        Self {
            window,
            stable: initial,
            candidate: None,
        }
    }

    /// The last committed value.
    pub fn stable(&self) -> bool {
        self.stable
    }

    /// Feed a raw sample. Returns the new value when a transition commits.
    pub fn observe(&mut self, raw: bool, now: Instant) -> Option<bool> {
        if raw == self.stable {
            self.candidate = None;
            return None;
        }

        match self.candidate {
            Some((value, _)) if value == raw => self.poll(now),
            _ => {
                self.candidate = Some((raw, now));
                self.poll(now)
            }
        }
    }

    /// Commit the pending candidate if it has outlasted the window.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let (value, since) = self.candidate?;
        if now.saturating_duration_since(since) < self.window {
            return None;
        }
        self.stable = value;
        self.candidate = None;
        Some(value)
    }

    /// When the pending candidate would commit, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.map(|(_, since)| since + self.window)
    }
}
