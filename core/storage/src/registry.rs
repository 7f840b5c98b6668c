//! Store registry for resolving a backend from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::KvStore;
use driftwood_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn KvStore>> + Send + Sync>;

/// Registry for key-value store factories.
///
/// Allows the engine bootstrap to pick a backend by name from its
/// configuration file.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by backend name and options.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Options invalid for the backend
    pub fn resolve(&self, name: &str, options: &Value) -> Result<Arc<dyn KvStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!(
                "Store backend '{}' is not registered (available: {})",
                name,
                self.backends().join(", ")
            ))
        })?;
        factory(options)
    }

    /// Get list of registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str<'a>(options: &'a Value, field: &str, backend: &str) -> Result<&'a str> {
    options.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
        Error::Config(format!(
            "Store backend '{}' requires a '{}' option",
            backend, field
        ))
    })
}

/// Create a registry with the built-in backends: `memory`, `local`
/// (`{"root": dir}`) and `sqlite` (`{"path": file}`).
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_options| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    registry.factories.insert(
        "local".to_string(),
        Box::new(|options| {
            let root = required_str(options, "root", "local")?;
            Ok(Arc::new(crate::local::LocalStore::new(root)?))
        }),
    );

    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|options| {
            let path = required_str(options, "path", "sqlite")?;
            Ok(Arc::new(crate::sqlite::SqliteStore::open(path)?))
        }),
    );

    registry
}
