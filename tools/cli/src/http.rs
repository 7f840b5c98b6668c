//! Built-in `http.request` task kind.
//!
//! Replays a recorded HTTP request against the backend. Client errors are
//! permanent; server errors, timeouts and connection failures are retried.

use async_trait::async_trait;
use driftwood_common::{Error, Result};
use driftwood_sync::{StrategyError, StrategyResult, SyncOperation, SyncStrategy};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// A queued HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Sent as a JSON body when present.
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl SyncOperation for HttpRequest {
    const KIND: &'static str = "http.request";

    fn validate(&self) -> Result<()> {
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidInput(format!("Invalid HTTP method: {}", self.method)))?;

        let url = Url::parse(&self.url)
            .map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        Ok(())
    }
}

/// Sends [`HttpRequest`] tasks with a shared client.
#[derive(Default)]
pub struct HttpStrategy {
    client: Client,
}

#[async_trait]
impl SyncStrategy<HttpRequest> for HttpStrategy {
    async fn execute(&self, op: HttpRequest) -> StrategyResult {
        let method = Method::from_bytes(op.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| StrategyError::permanent(format!("Invalid HTTP method: {}", op.method)))?;

        let mut request = self.client.request(method, &op.url);
        for (name, value) in &op.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &op.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_error(&e))?;
        classify_status(response.status())
    }
}

/// Map a response status onto the retry policy.
pub fn classify_status(status: StatusCode) -> StrategyResult {
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }

    let message = format!("Backend returned {}", status);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(StrategyError::transient(message))
    } else {
        Err(StrategyError::permanent(message))
    }
}

fn classify_error(error: &reqwest::Error) -> StrategyError {
    if error.is_builder() {
        StrategyError::permanent(format!("Invalid request: {}", error))
    } else {
        StrategyError::transient(format!("Request failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(method: &str, url: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT).is_ok());

        let err = classify_status(StatusCode::BAD_REQUEST).unwrap_err();
        assert!(!err.retryable);
        let err = classify_status(StatusCode::NOT_FOUND).unwrap_err();
        assert!(!err.retryable);

        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).unwrap_err().retryable);
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err().retryable);
    }

    #[test]
    fn test_validate() {
        assert!(request("post", "https://api.example.com/forms").validate().is_ok());
        assert!(request("PUT", "http://localhost:8080/x").validate().is_ok());
        assert!(request("POST", "not a url").validate().is_err());
        assert!(request("POST", "ftp://example.com/file").validate().is_err());
        assert!(request("GE T", "https://example.com").validate().is_err());
    }

    #[test]
    fn test_payload_defaults() {
        let op: HttpRequest =
            serde_json::from_value(json!({"url": "https://example.com/a", "body": {"x": 1}})).unwrap();
        assert_eq!(op.method, "POST");
        assert!(op.headers.is_empty());
        assert_eq!(op.body, Some(json!({"x": 1})));
    }
}
