//! Engine bootstrap: constructs, wires and owns every component.

use driftwood_cache::{CacheStats, PersistentCache};
use driftwood_common::{Result, Subscription};
use driftwood_connectivity::{
    ConnectionMonitor, ConnectionState, HttpProbe, ReachabilityProbe,
};
use driftwood_notify::{
    LogRenderer, NotificationDispatcher, NotificationRenderer, PreferenceStore,
};
use driftwood_realtime::{ChannelManager, ChannelState, Connector, WebSocketConnector};
use driftwood_storage::{create_default_registry, KvStore};
use driftwood_sync::{StrategyRegistry, SyncQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::EngineConfig;

/// Cache key prefix for payloads mirrored from realtime topics.
pub const TOPIC_CACHE_PREFIX: &str = "topic/";

/// Point-in-time view for pending indicators and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub connection: ConnectionState,
    pub pending: usize,
    pub failed: usize,
    pub channel: Option<ChannelState>,
    pub cache: CacheStats,
}

/// Collects host-supplied parts before starting an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    strategies: StrategyRegistry,
    renderer: Option<Arc<dyn NotificationRenderer>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    connector: Option<Arc<dyn Connector>>,
    store: Option<Arc<dyn KvStore>>,
}

impl EngineBuilder {
    /// Strategies for the task kinds the host will enqueue.
    pub fn strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    /// Renderer for notifications. Defaults to [`LogRenderer`].
    pub fn renderer(mut self, renderer: Arc<dyn NotificationRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Reachability probe. Defaults to an HTTP probe when
    /// `connectivity.probe_url` is set.
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Channel transport. Defaults to a WebSocket connector when
    /// `realtime.url` is set.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Durable store. Defaults to the configured registry backend.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration, open every component and start the
    /// background tasks.
    ///
    /// # Errors
    /// - The configuration is invalid
    /// - The storage backend cannot be opened
    /// - Persisted cache or queue records cannot be read
    pub async fn start(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => create_default_registry()
                .resolve(&config.storage.backend, &config.storage.options)?,
        };
        info!("Starting engine on {} store", store.name());

        let cache = PersistentCache::open(store.clone(), config.cache_config()).await?;

        let probe = match (self.probe, &config.connectivity.probe_url) {
            (Some(probe), _) => Some(probe),
            (None, Some(url)) => {
                let timeout = Duration::from_millis(config.connectivity.probe_timeout_ms);
                Some(Arc::new(HttpProbe::new(url, timeout)?) as Arc<dyn ReachabilityProbe>)
            }
            (None, None) => None,
        };
        let monitor = match probe {
            Some(probe) => ConnectionMonitor::with_probe(config.monitor_config(), probe),
            None => {
                debug!("No reachability probe; relying on host observations");
                ConnectionMonitor::new(config.monitor_config())
            }
        };

        let queue = SyncQueue::open(
            store.clone(),
            self.strategies,
            monitor.clone(),
            config.queue_config(),
        )
        .await?;

        let renderer = self.renderer.unwrap_or_else(|| Arc::new(LogRenderer));
        let dispatcher = NotificationDispatcher::new(
            Arc::new(PreferenceStore::new(config.notifications.clone())),
            renderer,
        );

        let mut subscriptions = vec![dispatcher.attach_queue(&queue)];

        let connector = match (self.connector, &config.realtime.url) {
            (Some(connector), _) => Some(connector),
            (None, Some(url)) => {
                Some(Arc::new(WebSocketConnector::new(url)?) as Arc<dyn Connector>)
            }
            (None, None) => None,
        };
        let channel = connector.map(|connector| {
            ChannelManager::new(config.channel_config(), connector, monitor.clone())
        });

        if let Some(channel) = &channel {
            subscriptions.push(dispatcher.attach_channel(channel));
            let ttl = config.realtime.cached_ttl_ms.map(Duration::from_millis);
            for topic in &config.realtime.cached_topics {
                let cache = cache.clone();
                let key = format!("{}{}", TOPIC_CACHE_PREFIX, topic);
                subscriptions.push(channel.subscribe(topic, move |envelope| {
                    cache.set(key.clone(), envelope.payload.clone(), ttl);
                }));
            }
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            monitor.spawn(cancel.child_token()),
            queue.spawn_worker(cancel.child_token()),
            cache.spawn_sweeper(
                Duration::from_millis(config.cache.sweep_interval_ms),
                cancel.child_token(),
            ),
        ];

        if let Some(channel) = &channel {
            if config.realtime.auto_connect {
                channel.connect();
            }
        }

        info!(
            "Engine started: {} pending tasks, {} cached entries",
            queue.pending_count(),
            cache.stats().entries
        );

        Ok(Engine {
            config,
            store,
            cache,
            monitor,
            queue,
            channel,
            dispatcher,
            cancel,
            tasks,
            _subscriptions: subscriptions,
        })
    }
}

/// One running instance of the offline-first engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn KvStore>,
    cache: PersistentCache,
    monitor: ConnectionMonitor,
    queue: SyncQueue,
    channel: Option<ChannelManager>,
    dispatcher: NotificationDispatcher,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _subscriptions: Vec<Subscription>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            strategies: StrategyRegistry::new(),
            renderer: None,
            probe: None,
            connector: None,
            store: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn cache(&self) -> &PersistentCache {
        &self.cache
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// The realtime channel, when one is configured.
    pub fn channel(&self) -> Option<&ChannelManager> {
        self.channel.as_ref()
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            connection: self.monitor.state(),
            pending: self.queue.pending_count(),
            failed: self.queue.failed().len(),
            channel: self.channel.as_ref().map(ChannelManager::state),
            cache: self.cache.stats(),
        }
    }

    /// Stop background work and wait for pending cache writes.
    pub async fn shutdown(self) {
        info!("Shutting down engine");

        if let Some(channel) = &self.channel {
            channel.disconnect().await;
        }
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        self.cache.flush().await;

        info!("Engine stopped");
    }
}
