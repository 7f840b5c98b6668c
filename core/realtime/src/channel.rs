//! The realtime channel manager: connection lifecycle, reconnection with
//! backoff, heartbeats, and inbound dispatch.

use driftwood_common::{Listeners, RetryConfig, Subscription};
use driftwood_connectivity::ConnectionMonitor;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::{Envelope, Frame};
use crate::router::TopicRouter;
use crate::transport::{Connector, TransportConnection};

/// Channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Reconnect when nothing has been received for this long.
    pub heartbeat_timeout: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Backoff between failed connection attempts.
    pub retry: RetryConfig,
    /// Consecutive failed attempts before the channel reports degraded.
    pub degraded_after_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::new(u32::MAX).with_max_delay(Duration::from_secs(30)),
            degraded_after_attempts: 20,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Automatic reconnection; `attempt` counts from 1 since the last
    /// successful connection.
    Reconnecting { attempt: u32 },
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => f.write_str("disconnected"),
            ChannelState::Connecting => f.write_str("connecting"),
            ChannelState::Connected => f.write_str("connected"),
            ChannelState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
        }
    }
}

/// Channel-level events.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    /// Every inbound message, after topic dispatch.
    Message(Envelope),
    /// Emitted once when consecutive failed attempts reach the ceiling.
    Degraded { attempts: u32 },
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct ChannelInner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    monitor: ConnectionMonitor,
    state: watch::Sender<ChannelState>,
    router: TopicRouter,
    events: Listeners<ChannelEvent>,
    control: Mutex<Control>,
    failed_attempts: AtomicU32,
    next_ping: AtomicU64,
}

/// Owns the single logical channel to the backend.
///
/// After [`connect`](Self::connect) a supervisor task keeps the channel up
/// whenever the monitor reports online, until [`disconnect`](Self::disconnect).
/// Clones share the same channel.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ChannelInner>,
}

impl ChannelManager {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        monitor: ConnectionMonitor,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                connector,
                monitor,
                state,
                router: TopicRouter::new(),
                events: Listeners::new(),
                control: Mutex::new(Control::default()),
                failed_attempts: AtomicU32::new(0),
                next_ping: AtomicU64::new(0),
            }),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Watch channel carrying the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.failed_attempts.load(Ordering::SeqCst)
    }

    /// Handle messages on `topic`.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(topic, handler)
    }

    /// Handle messages on topics nobody subscribed to.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe_unmatched<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_unmatched(handler)
    }

    /// Receive channel events.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe_events<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Send a message. Dropped (returns false) unless connected; use the
    /// sync queue for guaranteed delivery.
    pub fn send(&self, topic: &str, payload: Value) -> bool {
        if self.state() != ChannelState::Connected {
            debug!("Dropping message for {}: channel is {}", topic, self.state());
            return false;
        }
        let text = match Frame::Message(Envelope::new(topic, payload)).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", topic, e);
                return false;
            }
        };
        match &self.control().outbound {
            Some(outbound) => outbound.send(text).is_ok(),
            None => false,
        }
    }

    /// Start keeping the channel up. A no-op when already started.
    pub fn connect(&self) {
        let mut control = self.control();
        if control.cancel.as_ref().is_some_and(|c| !c.is_cancelled()) {
            debug!("Channel supervisor already running");
            return;
        }

        let cancel = CancellationToken::new();
        control.cancel = Some(cancel.clone());
        self.inner.failed_attempts.store(0, Ordering::SeqCst);
        let manager = self.clone();
        control.supervisor = Some(tokio::spawn(async move { manager.supervise(cancel).await }));
        info!("Channel to {} started", self.inner.connector.endpoint());
    }

    /// Close the channel and stay disconnected until the next `connect`.
    pub async fn disconnect(&self) {
        let (cancel, supervisor) = {
            let mut control = self.control();
            control.outbound = None;
            (control.cancel.take(), control.supervisor.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!("Channel supervisor ended abnormally: {}", e);
            }
        }
        self.set_state(ChannelState::Disconnected);
        info!("Channel disconnected");
    }

    fn set_state(&self, state: ChannelState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("Channel state: {}", state);
            self.inner.events.emit(&ChannelEvent::StateChanged(state));
        }
    }

    async fn supervise(&self, cancel: CancellationToken) {
        let config = &self.inner.config;
        let mut online = self.inner.monitor.watch_online();
        let mut reconnecting = false;
        let mut degraded = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !self.inner.monitor.is_online() {
                self.set_state(ChannelState::Disconnected);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wait_until(&mut online, true) => {}
                }
                continue;
            }

            let failures = self.reconnect_attempts();
            if reconnecting {
                self.set_state(ChannelState::Reconnecting {
                    attempt: failures + 1,
                });
            } else {
                self.set_state(ChannelState::Connecting);
            }

            let attempt = tokio::time::timeout(config.connect_timeout, self.inner.connector.connect());
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = attempt => result,
            };

            let error = match result {
                Ok(Ok(connection)) => {
                    self.inner.failed_attempts.store(0, Ordering::SeqCst);
                    degraded = false;
                    info!("Channel connected to {}", self.inner.connector.endpoint());

                    match self.run_session(connection, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) => {
                            warn!("Channel connection lost: {}", reason);
                            self.set_state(ChannelState::Disconnected);
                            reconnecting = true;
                            continue;
                        }
                    }
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {:?}", config.connect_timeout),
            };

            let failures = self.inner.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            reconnecting = true;
            self.set_state(ChannelState::Disconnected);

            let delay = config.retry.delay_for_attempt(failures - 1);
            warn!(
                "Channel connect attempt {} failed: {}; retrying in {:?}",
                failures, error, delay
            );

            if failures >= config.degraded_after_attempts && !degraded {
                degraded = true;
                error!("Channel degraded after {} failed attempts", failures);
                self.inner
                    .events
                    .emit(&ChannelEvent::Degraded { attempts: failures });
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.control().outbound = None;
        self.set_state(ChannelState::Disconnected);
        debug!("Channel supervisor stopped");
    }

    async fn run_session(
        &self,
        connection: TransportConnection,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let TransportConnection {
            mut sink,
            mut stream,
        } = connection;
        let config = &self.inner.config;

        let (outbound_tx, mut outbound) = mpsc::unbounded_channel::<String>();
        self.control().outbound = Some(outbound_tx);
        self.set_state(ChannelState::Connected);

        let mut online = self.inner.monitor.watch_online();
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        let mut last_seen = Instant::now();

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(text).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                }
                received = stream.recv() => match received {
                    Ok(Some(text)) => {
                        last_seen = Instant::now();
                        if let Some(reply) = self.handle_frame(&text) {
                            if let Err(e) = sink.send(reply).await {
                                break SessionEnd::Lost(e.to_string());
                            }
                        }
                    }
                    Ok(None) => break SessionEnd::Lost("closed by server".to_string()),
                    Err(e) => break SessionEnd::Lost(e.to_string()),
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= config.heartbeat_timeout {
                        break SessionEnd::Lost(format!(
                            "no frame received for {:?}",
                            last_seen.elapsed()
                        ));
                    }
                    let ping = Frame::Ping {
                        id: self.inner.next_ping.fetch_add(1, Ordering::SeqCst),
                    };
                    if let Ok(text) = ping.encode() {
                        if let Err(e) = sink.send(text).await {
                            break SessionEnd::Lost(e.to_string());
                        }
                    }
                }
                _ = wait_until(&mut online, false) => {
                    break SessionEnd::Lost("monitor reports offline".to_string());
                }
            }
        };

        self.control().outbound = None;
        if let Err(e) = sink.close().await {
            debug!("Error closing channel connection: {}", e);
        }
        end
    }

    /// Dispatch an inbound frame. Returns the reply to send, if any.
    fn handle_frame(&self, text: &str) -> Option<String> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring malformed frame: {}", e);
                return None;
            }
        };

        match frame {
            Frame::Message(envelope) => {
                let delivered = self.inner.router.dispatch(&envelope);
                debug!("Message on {} delivered to {} handlers", envelope.topic, delivered);
                self.inner.events.emit(&ChannelEvent::Message(envelope));
                None
            }
            Frame::Ping { id } => Frame::Pong { id }.encode().ok(),
            Frame::Pong { .. } => None,
        }
    }
}

/// Resolve once the published online flag equals `up`.
async fn wait_until(online: &mut watch::Receiver<bool>, up: bool) -> bool {
    online.wait_for(|value| *value == up).await.is_ok()
}
