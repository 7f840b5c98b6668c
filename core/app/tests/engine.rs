use driftwood_app::{Engine, EngineConfig, TOPIC_CACHE_PREFIX};
use driftwood_cache::CacheValue;
use driftwood_common::Priority;
use driftwood_notify::RecordingRenderer;
use driftwood_realtime::{ChannelState, Envelope, Frame, MemoryConnector, NotificationHint};
use driftwood_storage::{LocalStore, MemoryStore};
use driftwood_sync::{StrategyError, StrategyRegistry};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.connectivity.stabilization_ms = 0;
    config.queue.base_delay_ms = 5;
    config.queue.max_delay_ms = 20;
    config.realtime.heartbeat_interval_ms = 50;
    config.realtime.heartbeat_timeout_ms = 200;
    config.realtime.base_delay_ms = 5;
    config.realtime.max_delay_ms = 20;
    config
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn recording_strategies(kind: &str, calls: Arc<Mutex<Vec<String>>>) -> StrategyRegistry {
    let mut strategies = StrategyRegistry::new();
    strategies
        .register_fn(kind, move |payload: Value| {
            let calls = calls.clone();
            async move {
                calls
                    .lock()
                    .unwrap()
                    .push(payload["label"].as_str().unwrap_or_default().to_string());
                Ok(())
            }
        })
        .unwrap();
    strategies
}

#[tokio::test]
async fn test_offline_queue_drains_by_priority_when_online() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::builder(test_config())
        .store(Arc::new(MemoryStore::new()))
        .strategies(recording_strategies("form.submit", calls.clone()))
        .start()
        .await
        .unwrap();
    let queue = engine.queue();

    for (label, priority) in [
        ("low", Priority::Low),
        ("high", Priority::High),
        ("medium", Priority::Medium),
    ] {
        queue
            .enqueue("form.submit", json!({"label": label}), priority)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(engine.status().pending, 3);

    engine.monitor().observe(true, None);
    eventually(|| engine.status().pending == 0).await;
    assert_eq!(*calls.lock().unwrap(), vec!["high", "medium", "low"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_always_failing_task_notifies_once() {
    let mut config = test_config();
    config.connectivity.initial_online = true;
    config.queue.max_attempts = 3;

    let mut strategies = StrategyRegistry::new();
    strategies
        .register_fn("form.submit", |_| async {
            Err(StrategyError::transient("server unavailable"))
        })
        .unwrap();
    let renderer = RecordingRenderer::new();

    let engine = Engine::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .strategies(strategies)
        .renderer(Arc::new(renderer.clone()))
        .start()
        .await
        .unwrap();

    let id = engine
        .queue()
        .enqueue("form.submit", json!({}), Priority::High)
        .await
        .unwrap();

    eventually(|| engine.status().failed == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let failed = engine.queue().failed();
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].attempts, 3);

    let rendered = renderer.rendered();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].metadata["category"], "sync.failed");
    assert_eq!(rendered[0].metadata["task_id"], json!(id.to_string()));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_channel_mirrors_topics_and_forwards_notifications() {
    let mut config = test_config();
    config.connectivity.initial_online = true;
    config.realtime.cached_topics = vec!["prices".to_string()];

    let connector = MemoryConnector::new();
    let renderer = RecordingRenderer::new();
    let engine = Engine::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .connector(Arc::new(connector.clone()))
        .renderer(Arc::new(renderer.clone()))
        .start()
        .await
        .unwrap();

    let channel = engine.channel().unwrap();
    eventually(|| channel.state() == ChannelState::Connected).await;

    connector.publish("prices", json!({"eur": 1.08}));
    let cache = engine.cache();
    let key = format!("{}prices", TOPIC_CACHE_PREFIX);
    eventually(|| cache.get(&key).is_some()).await;
    assert_eq!(cache.get(&key), Some(CacheValue::Json(json!({"eur": 1.08}))));

    let hinted = Envelope::new("orders", json!({"id": 9})).with_notification(NotificationHint {
        category: "orders.shipped".to_string(),
        title: "Shipped".to_string(),
        body: "Order 9 is on its way".to_string(),
        metadata: Map::new(),
    });
    connector.push(&Frame::Message(hinted));
    eventually(|| !renderer.rendered().is_empty()).await;
    assert_eq!(renderer.rendered()[0].title, "Shipped");
    assert_eq!(renderer.rendered()[0].metadata["topic"], "orders");

    engine.shutdown().await;
    assert!(!connector.is_connected());
}

#[tokio::test]
async fn test_channel_reconnects_automatically() {
    let mut config = test_config();
    config.connectivity.initial_online = true;

    let connector = MemoryConnector::new();
    let engine = Engine::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .connector(Arc::new(connector.clone()))
        .start()
        .await
        .unwrap();

    let channel = engine.channel().unwrap();
    eventually(|| channel.state() == ChannelState::Connected).await;

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let _sub = channel.subscribe_events(move |event| {
        if let driftwood_realtime::ChannelEvent::StateChanged(state) = event {
            sink.lock().unwrap().push(*state);
        }
    });

    connector.drop_connection();
    eventually(|| connector.connects() == 2 && channel.state() == ChannelState::Connected).await;
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ChannelState::Disconnected,
            ChannelState::Reconnecting { attempt: 1 },
            ChannelState::Connected,
        ]
    );
    assert_eq!(channel.reconnect_attempts(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let first = Engine::builder(test_config())
        .store(Arc::new(LocalStore::new(dir.path()).unwrap()))
        .strategies(recording_strategies("form.submit", calls.clone()))
        .start()
        .await
        .unwrap();
    first
        .queue()
        .enqueue("form.submit", json!({"label": "queued offline"}), Priority::Medium)
        .await
        .unwrap();
    first.cache().set("profile", json!({"name": "ada"}), None);
    first.shutdown().await;

    let mut config = test_config();
    config.connectivity.initial_online = true;
    let second = Engine::builder(config)
        .store(Arc::new(LocalStore::new(dir.path()).unwrap()))
        .strategies(recording_strategies("form.submit", calls.clone()))
        .start()
        .await
        .unwrap();

    assert_eq!(
        second.cache().get("profile"),
        Some(CacheValue::Json(json!({"name": "ada"})))
    );
    eventually(|| second.status().pending == 0).await;
    assert_eq!(*calls.lock().unwrap(), vec!["queued offline"]);

    second.shutdown().await;
}

#[tokio::test]
async fn test_registry_backend_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage.backend = "sqlite".to_string();
    config.storage.options = json!({"path": dir.path().join("engine.db")});

    let engine = Engine::builder(config).start().await.unwrap();
    assert_eq!(engine.store().name(), "sqlite");
    assert!(engine.channel().is_none());
    engine.shutdown().await;

    let mut config = test_config();
    config.storage.backend = "nonexistent".to_string();
    assert!(Engine::builder(config).start().await.is_err());
}
