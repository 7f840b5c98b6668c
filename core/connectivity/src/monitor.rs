//! Debounced online/offline tracking.

use chrono::Utc;
use driftwood_common::{Listeners, Subscription};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::debounce::Debouncer;
use crate::probe::{classify_rtt, ReachabilityProbe};
use crate::state::{ConnectionState, EffectiveType};

/// Connection monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between reachability probes.
    pub probe_interval: Duration,
    /// Upper bound on a single probe.
    pub probe_timeout: Duration,
    /// How long a new raw state must persist before it is published.
    pub stabilization_window: Duration,
    /// Published state before the first observation.
    pub initial_online: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            stabilization_window: Duration::from_secs(2),
            initial_online: false,
        }
    }
}

struct MonitorState {
    published: ConnectionState,
    link_up: bool,
    reachable: bool,
    debouncer: Debouncer,
}

impl MonitorState {
    fn raw_online(&self) -> bool {
        self.link_up && self.reachable
    }

    fn commit(&mut self, online: bool) -> ConnectionState {
        let now = Utc::now();
        self.published.is_online = online;
        if online {
            self.published.last_online_at = Some(now);
        } else {
            self.published.last_offline_at = Some(now);
        }
        self.published.clone()
    }
}

struct MonitorInner {
    config: MonitorConfig,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    state: Mutex<MonitorState>,
    listeners: Listeners<ConnectionState>,
    online: watch::Sender<bool>,
    link_changed: Notify,
    /// Signalled when the debounce deadline moves, so `run` re-arms its timer.
    deadline_changed: Notify,
}

/// Single source of truth for whether the backend is reachable.
///
/// Raw state is `link up AND last probe reachable`; a change of raw state
/// is published only after it persists for the stabilization window.
/// Clones share the same monitor.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
    /// Create a monitor without a probe. Reachability then comes only from
    /// [`observe`](Self::observe).
    pub fn new(config: MonitorConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a monitor that probes the backend from [`run`](Self::run).
    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self::build(config, Some(probe))
    }

    fn build(config: MonitorConfig, probe: Option<Arc<dyn ReachabilityProbe>>) -> Self {
        let initial = config.initial_online;
        let state = MonitorState {
            published: ConnectionState {
                is_online: initial,
                ..ConnectionState::default()
            },
            link_up: true,
            reachable: initial,
            debouncer: Debouncer::new(initial, config.stabilization_window),
        };
        let (online, _) = watch::channel(initial);

        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                state: Mutex::new(state),
                listeners: Listeners::new(),
                online,
                link_changed: Notify::new(),
                deadline_changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the backend is currently considered reachable.
    pub fn is_online(&self) -> bool {
        self.lock().published.is_online
    }

    /// Snapshot of the published state.
    pub fn state(&self) -> ConnectionState {
        self.lock().published.clone()
    }

    /// Receive every published online/offline transition.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(callback)
    }

    /// Watch channel carrying the published online flag, for async waiters.
    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Report a host link change. A link coming back up triggers an
    /// immediate probe from the running loop.
    pub fn report_link(&self, up: bool) {
        let changed = {
            let mut state = self.lock();
            let changed = state.link_up != up;
            state.link_up = up;
            changed
        };
        if changed {
            debug!("Host link reported {}", if up { "up" } else { "down" });
            self.inner.link_changed.notify_one();
        }
        self.evaluate(Instant::now());
    }

    /// Record a reachability observation. `effective` replaces the link
    /// quality when given.
    pub fn observe(&self, reachable: bool, effective: Option<EffectiveType>) {
        {
            let mut state = self.lock();
            state.reachable = reachable;
            if let Some(effective) = effective {
                state.published.effective_type = effective;
            }
        }
        self.evaluate(Instant::now());
    }

    /// Run one probe and record its outcome. Returns whether it succeeded.
    pub async fn probe_once(&self) -> bool {
        let Some(probe) = self.inner.probe.clone() else {
            return self.lock().reachable;
        };

        match tokio::time::timeout(self.inner.config.probe_timeout, probe.probe()).await {
            Ok(Ok(rtt)) => {
                self.observe(true, Some(classify_rtt(rtt)));
                true
            }
            Ok(Err(e)) => {
                debug!("Reachability probe failed: {}", e);
                self.observe(false, None);
                false
            }
            Err(_) => {
                debug!("Reachability probe timed out");
                self.observe(false, None);
                false
            }
        }
    }

    fn evaluate(&self, now: Instant) {
        let (published, rearmed) = {
            let mut state = self.lock();
            let before = state.debouncer.deadline();
            let raw = state.raw_online();
            let published = state
                .debouncer
                .observe(raw, now)
                .map(|online| state.commit(online));
            (published, state.debouncer.deadline() != before)
        };
        if rearmed {
            self.inner.deadline_changed.notify_one();
        }
        if let Some(published) = published {
            self.publish(published);
        }
    }

    fn poll(&self, now: Instant) {
        let published = {
            let mut state = self.lock();
            state
                .debouncer
                .poll(now)
                .map(|online| state.commit(online))
        };
        if let Some(published) = published {
            self.publish(published);
        }
    }

    fn publish(&self, published: ConnectionState) {
        info!(
            "Connection is now {} ({})",
            if published.is_online { "online" } else { "offline" },
            published.effective_type
        );
        self.inner.online.send_replace(published.is_online);
        self.inner.listeners.emit(&published);
    }

    fn pending_deadline(&self) -> Option<Instant> {
        self.lock().debouncer.deadline()
    }

    /// Probe periodically and commit debounced transitions until `cancel`
    /// fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.pending_deadline();
            let settle = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                _ = self.inner.link_changed.notified() => {
                    if self.lock().link_up {
                        self.probe_once().await;
                    }
                }
                _ = settle => {
                    self.poll(Instant::now());
                }
                _ = self.inner.deadline_changed.notified() => {}
            }
        }

        debug!("Connection monitor stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use driftwood_common::{Error, Result};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn instant_config() -> MonitorConfig {
        MonitorConfig {
            stabilization_window: Duration::ZERO,
            ..MonitorConfig::default()
        }
    }

    struct ToggleProbe {
        up: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReachabilityProbe for ToggleProbe {
        async fn probe(&self) -> Result<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(40))
            } else {
                Err(Error::Network("unreachable".to_string()))
            }
        }
    }

    #[test]
    fn test_initial_state() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        assert!(!monitor.is_online());

        let monitor = ConnectionMonitor::new(MonitorConfig {
            initial_online: true,
            ..MonitorConfig::default()
        });
        assert!(monitor.is_online());
    }

    #[test]
    fn test_observe_publishes_transitions() {
        let monitor = ConnectionMonitor::new(instant_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = monitor.subscribe(move |state| sink.lock().unwrap().push(state.is_online));

        monitor.observe(true, Some(EffectiveType::Fast));
        assert!(monitor.is_online());
        assert_eq!(monitor.state().effective_type, EffectiveType::Fast);
        assert!(monitor.state().last_online_at.is_some());

        // Same raw state again publishes nothing.
        monitor.observe(true, None);
        monitor.observe(false, None);
        assert!(!monitor.is_online());
        assert!(monitor.state().last_offline_at.is_some());

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_link_down_overrides_reachability() {
        let monitor = ConnectionMonitor::new(instant_config());
        monitor.observe(true, None);
        assert!(monitor.is_online());

        monitor.report_link(false);
        assert!(!monitor.is_online());

        // Reachable but no link is still offline.
        monitor.observe(true, None);
        assert!(!monitor.is_online());

        monitor.report_link(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_stabilization_window_suppresses_flaps() {
        let monitor = ConnectionMonitor::new(MonitorConfig {
            stabilization_window: Duration::from_millis(200),
            ..MonitorConfig::default()
        });
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        let _sub = monitor.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.observe(true, None);
        monitor.observe(false, None);
        monitor.observe(true, None);
        assert!(!monitor.is_online());
        assert_eq!(transitions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_commits_after_window() {
        let monitor = ConnectionMonitor::new(MonitorConfig {
            stabilization_window: Duration::from_millis(50),
            probe_interval: Duration::from_secs(3600),
            ..MonitorConfig::default()
        });
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());

        let mut online = monitor.watch_online();
        monitor.observe(true, None);
        assert!(!monitor.is_online());

        tokio::time::timeout(Duration::from_secs(2), online.wait_for(|up| *up))
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_observe_after_loop_parked_commits_within_window() {
        let monitor = ConnectionMonitor::new(MonitorConfig {
            stabilization_window: Duration::from_millis(50),
            probe_interval: Duration::from_secs(3600),
            ..MonitorConfig::default()
        });
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());

        // Let the first tick pass so the loop parks with no deadline.
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.observe(true, None);
        assert!(!monitor.is_online());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_once_classifies_rtt() {
        let probe = Arc::new(ToggleProbe {
            up: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let monitor = ConnectionMonitor::with_probe(instant_config(), probe.clone());

        assert!(monitor.probe_once().await);
        assert!(monitor.is_online());
        assert_eq!(monitor.state().effective_type, EffectiveType::Fast);

        probe.up.store(false, Ordering::SeqCst);
        assert!(!monitor.probe_once().await);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_link_up_triggers_probe() {
        let probe = Arc::new(ToggleProbe {
            up: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let monitor = ConnectionMonitor::with_probe(
            MonitorConfig {
                stabilization_window: Duration::ZERO,
                probe_interval: Duration::from_secs(3600),
                ..MonitorConfig::default()
            },
            probe.clone(),
        );
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());

        // The first interval tick probes immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert!(monitor.is_online());

        monitor.report_link(false);
        assert!(!monitor.is_online());
        monitor.report_link(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }
}
