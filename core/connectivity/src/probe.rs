//! Backend reachability probes.

use async_trait::async_trait;
use driftwood_common::{Error, Result};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use crate::state::EffectiveType;

/// Round-trip time below which the link counts as fast.
pub const FAST_RTT: Duration = Duration::from_millis(150);

/// Round-trip time below which the link counts as medium.
pub const MEDIUM_RTT: Duration = Duration::from_millis(600);

/// Checks whether the backend can be reached.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns the round-trip time on success.
    async fn probe(&self) -> Result<Duration>;
}

/// Classify a probe round-trip time.
pub fn classify_rtt(rtt: Duration) -> EffectiveType {
    if rtt < FAST_RTT {
        EffectiveType::Fast
    } else if rtt < MEDIUM_RTT {
        EffectiveType::Medium
    } else {
        EffectiveType::Slow
    }
}

/// Probe that issues an HTTP `HEAD` request.
///
/// Any response below 500 counts as reachable: the backend answered, even
/// if it did not like the request.
pub struct HttpProbe {
    http: Client,
    url: Url,
}

impl HttpProbe {
    /// Create a probe against `url`.
    ///
    /// # Errors
    /// - `url` does not parse
    /// - The HTTP client cannot be built
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid probe URL {}: {}", url, e)))?;
        let http = Client::builder()
            .user_agent(concat!("driftwood/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .http
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("Probe of {} timed out", self.url))
                } else {
                    Error::Network(format!("Probe of {} failed: {}", self.url, e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Network(format!(
                "Probe of {} returned {}",
                self.url, status
            )));
        }

        let rtt = started.elapsed();
        debug!("Probe of {} answered {} in {:?}", self.url, status, rtt);
        Ok(rtt)
    }
}
