//! Backend factory registry.
//!
//! Maps a backend type tag (the `type` option) to a factory that builds a
//! [`CacheBackend`] from a [`BackendConfig`]. The defaults register `sqlite`,
//! its alias `document`, and `memory`; applications may add their own tags.

use super::memory::MemoryStore;
use super::sqlite::SqliteDocumentStore;
use super::traits::CacheBackend;
use crate::config::BackendConfig;
use crate::error::{CellarError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Factory building a backend from configuration.
pub type BackendFactory =
    Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn CacheBackend>> + Send + Sync>;

/// Registry of backend factories keyed by type tag.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("BackendRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let sqlite: BackendFactory =
            Arc::new(|config: &BackendConfig| -> Result<Arc<dyn CacheBackend>> {
                Ok(Arc::new(SqliteDocumentStore::from_config(config)?))
            });
        registry.register_factory("sqlite", Arc::clone(&sqlite));
        registry.register_factory("document", sqlite);

        registry.register("memory", |_config| {
            Ok(Arc::new(MemoryStore::new()) as Arc<dyn CacheBackend>)
        });

        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&BackendConfig) -> Result<Arc<dyn CacheBackend>> + Send + Sync + 'static,
    {
        self.register_factory(kind, Arc::new(factory));
    }

    fn register_factory(&mut self, kind: &str, factory: BackendFactory) {
        self.factories.insert(kind.to_ascii_lowercase(), factory);
    }

    /// Whether a factory is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.to_ascii_lowercase())
    }

    /// Build a backend for `config`.
    pub fn create(&self, config: &BackendConfig) -> Result<Arc<dyn CacheBackend>> {
        let kind = config.kind.to_ascii_lowercase();
        let factory = self.factories.get(&kind).ok_or_else(|| {
            CellarError::config(format!("unknown backend type '{}'", config.kind))
        })?;

        debug!("Creating '{}' backend", kind);
        factory(config)
    }
}
