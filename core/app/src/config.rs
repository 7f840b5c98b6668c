//! Engine configuration.
//!
//! Stored as JSON. Every field has a default, so an empty object is a
//! valid configuration. Durations are in milliseconds.

use driftwood_cache::CacheConfig;
use driftwood_common::{Error, Result, RetryConfig};
use driftwood_connectivity::MonitorConfig;
use driftwood_notify::Preferences;
use driftwood_realtime::ChannelConfig;
use driftwood_sync::QueueConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Durable store selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Registered backend name: `memory`, `local` or `sqlite`.
    pub backend: String,
    /// Backend options, e.g. `{"root": "..."}` or `{"path": "..."}`.
    pub options: Value,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            options: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub budget_bytes: u64,
    pub default_ttl_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            budget_bytes: 5 * 1024 * 1024,
            default_ttl_ms: None,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySection {
    /// Endpoint for the HTTP `HEAD` reachability probe.
    pub probe_url: Option<String>,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub stabilization_ms: u64,
    /// Online state assumed before the first observation.
    pub initial_online: bool,
}

impl Default for ConnectivitySection {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_ms: 15_000,
            probe_timeout_ms: 5_000,
            stabilization_ms: 2_000,
            initial_online: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub default_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            default_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    /// `ws://` or `wss://` endpoint. No channel is created without one
    /// unless the host supplies a connector.
    pub url: Option<String>,
    /// Connect as soon as the engine starts.
    pub auto_connect: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub degraded_after_attempts: u32,
    /// Topics whose latest payload is mirrored into the cache.
    pub cached_topics: Vec<String>,
    pub cached_ttl_ms: Option<u64>,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            url: None,
            auto_connect: true,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            degraded_after_attempts: 20,
            cached_topics: Vec::new(),
            cached_ttl_ms: None,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageSection,
    pub cache: CacheSection,
    pub connectivity: ConnectivitySection,
    pub queue: QueueSection,
    pub realtime: RealtimeSection,
    pub notifications: Preferences,
}

impl EngineConfig {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    /// - The file cannot be read
    /// - The JSON is malformed
    /// - Validation fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    /// Serialize configuration to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend.is_empty() {
            return Err(Error::Config("storage.backend is empty".to_string()));
        }
        if self.cache.budget_bytes == 0 {
            return Err(Error::Config("cache.budget_bytes must be positive".to_string()));
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err(Error::Config(
                "cache.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.connectivity.probe_interval_ms == 0 {
            return Err(Error::Config(
                "connectivity.probe_interval_ms must be positive".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.queue.jitter) {
            return Err(Error::Config("queue.jitter must be within 0..=1".to_string()));
        }
        if self.queue.base_delay_ms > self.queue.max_delay_ms {
            return Err(Error::Config(
                "queue.base_delay_ms exceeds queue.max_delay_ms".to_string(),
            ));
        }
        if self.realtime.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "realtime.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.realtime.heartbeat_timeout_ms <= self.realtime.heartbeat_interval_ms {
            return Err(Error::Config(
                "realtime.heartbeat_timeout_ms must exceed the heartbeat interval".to_string(),
            ));
        }
        if self.realtime.base_delay_ms > self.realtime.max_delay_ms {
            return Err(Error::Config(
                "realtime.base_delay_ms exceeds realtime.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            budget_bytes: self.cache.budget_bytes,
            default_ttl: self.cache.default_ttl_ms.map(Duration::from_millis),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            probe_interval: Duration::from_millis(self.connectivity.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.connectivity.probe_timeout_ms),
            stabilization_window: Duration::from_millis(self.connectivity.stabilization_ms),
            initial_online: self.connectivity.initial_online,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry: RetryConfig::new(self.queue.max_attempts)
                .with_initial_delay(Duration::from_millis(self.queue.base_delay_ms))
                .with_max_delay(Duration::from_millis(self.queue.max_delay_ms))
                .with_jitter(self.queue.jitter),
            default_timeout: Duration::from_millis(self.queue.default_timeout_ms),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let realtime = &self.realtime;
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(realtime.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(realtime.heartbeat_timeout_ms),
            connect_timeout: Duration::from_millis(realtime.connect_timeout_ms),
            retry: RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(realtime.base_delay_ms))
                .with_max_delay(Duration::from_millis(realtime.max_delay_ms)),
            degraded_after_attempts: realtime.degraded_after_attempts,
        }
    }
}
