//! Typed sync operations and the strategy registry.
//!
//! Each task kind is described by a [`SyncOperation`] payload type and
//! executed by a [`SyncStrategy`] for that type. The registry erases the
//! payload type so the queue can store tasks as JSON and deserialize them
//! right before invocation.

use async_trait::async_trait;
use driftwood_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A strongly typed task payload.
pub trait SyncOperation: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Task kind this payload is registered and queued under.
    const KIND: &'static str;

    /// Reject malformed payloads before they are queued.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Failure reported by a strategy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StrategyError {
    pub message: String,
    /// `false` fails the task immediately instead of retrying.
    pub retryable: bool,
}

impl StrategyError {
    /// A failure worth retrying with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<Error> for StrategyError {
    fn from(error: Error) -> Self {
        Self {
            retryable: error.is_transient(),
            message: error.to_string(),
        }
    }
}

pub type StrategyResult = std::result::Result<(), StrategyError>;

/// Executes operations of type `O` against the backend.
#[async_trait]
pub trait SyncStrategy<O: SyncOperation>: Send + Sync {
    async fn execute(&self, op: O) -> StrategyResult;
}

#[async_trait]
trait ErasedStrategy: Send + Sync {
    async fn invoke(&self, payload: Value) -> StrategyResult;
}

struct Typed<O, S> {
    strategy: S,
    _op: PhantomData<fn() -> O>,
}

#[async_trait]
impl<O, S> ErasedStrategy for Typed<O, S>
where
    O: SyncOperation,
    S: SyncStrategy<O>,
{
    async fn invoke(&self, payload: Value) -> StrategyResult {
        let op: O = serde_json::from_value(payload)
            .map_err(|e| StrategyError::permanent(format!("Invalid {} payload: {}", O::KIND, e)))?;
        op.validate()
            .map_err(|e| StrategyError::permanent(e.to_string()))?;
        self.strategy.execute(op).await
    }
}

struct FnStrategy<F>(F);

#[async_trait]
impl<F, Fut> ErasedStrategy for FnStrategy<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = StrategyResult> + Send + 'static,
{
    async fn invoke(&self, payload: Value) -> StrategyResult {
        (self.0)(payload).await
    }
}

/// Maps task kinds to strategies. Clones share the registered strategies.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ErasedStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, kind: String, strategy: Arc<dyn ErasedStrategy>) -> Result<()> {
        if self.strategies.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Strategy for '{}' already registered",
                kind
            )));
        }
        self.strategies.insert(kind, strategy);
        Ok(())
    }

    /// Register a typed strategy under `O::KIND`.
    ///
    /// # Errors
    /// - A strategy is already registered for the kind
    pub fn register<O, S>(&mut self, strategy: S) -> Result<()>
    where
        O: SyncOperation,
        S: SyncStrategy<O> + 'static,
    {
        self.insert(
            O::KIND.to_string(),
            Arc::new(Typed {
                strategy,
                _op: PhantomData,
            }),
        )
    }

    /// Register an untyped strategy that receives the raw JSON payload.
    ///
    /// # Errors
    /// - A strategy is already registered for the kind
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, strategy: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StrategyResult> + Send + 'static,
    {
        self.insert(kind.into(), Arc::new(FnStrategy(strategy)))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.strategies.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.strategies.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Dispatch a payload to the strategy for `kind`.
    pub async fn invoke(&self, kind: &str, payload: Value) -> StrategyResult {
        let strategy = self
            .strategies
            .get(kind)
            .cloned()
            .ok_or_else(|| StrategyError::permanent(format!("No strategy for '{}'", kind)))?;
        strategy.invoke(payload).await
    }
}
