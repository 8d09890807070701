//! Registry of named caches and pooled backends.
//!
//! The manager is an explicit value created at startup and shared (usually in
//! an `Arc`) by everything that needs a cache. Caches are memoized by name and
//! normalized configuration; backends are pooled by store identity, so caches
//! with different names or expirations on the same database share one
//! connection.

use crate::backend::{BackendRegistry, CacheBackend};
use crate::cache::Cache;
use crate::config::{parse_regions, BackendConfig};
use crate::error::{CellarError, Result};
use crate::namespace::NamespaceManager;
use crate::session::SessionStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

type CacheKey = (String, String);

/// Memoizing factory for caches.
pub struct CacheManager {
    registry: BackendRegistry,
    defaults: BackendConfig,
    regions: HashMap<String, BackendConfig>,
    caches: Mutex<HashMap<CacheKey, Arc<Cache>>>,
    backends: Mutex<HashMap<String, Arc<dyn CacheBackend>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("defaults", &self.defaults)
            .field("regions", &self.regions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lock_map<'a, K, V>(
    map: &'a Mutex<HashMap<K, V>>,
    what: &str,
) -> Result<MutexGuard<'a, HashMap<K, V>>> {
    map.lock()
        .map_err(|e| CellarError::unavailable(format!("Failed to lock {}: {}", what, e)))
}

impl CacheManager {
    /// Create a manager with a backend registry and default configuration.
    pub fn new(registry: BackendRegistry, defaults: BackendConfig) -> Self {
        Self {
            registry,
            defaults,
            regions: HashMap::new(),
            caches: Mutex::new(HashMap::new()),
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Manager with the built-in backends and an in-memory default.
    pub fn with_defaults() -> Self {
        Self::new(BackendRegistry::with_defaults(), BackendConfig::default())
    }

    /// Add named configuration presets.
    pub fn with_regions(mut self, regions: HashMap<String, BackendConfig>) -> Self {
        self.regions.extend(regions);
        self
    }

    /// Build a manager from a flat option mapping such as
    /// `cache.type = sqlite`, `cache.url = ...`, `cache.regions = short, long`.
    ///
    /// Unknown backend types fail here rather than on first use.
    pub fn from_options<K, V>(prefix: &str, options: &[(K, V)]) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let registry = BackendRegistry::with_defaults();
        let defaults = BackendConfig::from_options(
            prefix,
            options
                .iter()
                .map(|(k, v)| (k.as_ref(), v.as_ref().to_string())),
        )?;
        let regions = parse_regions(prefix, options)?;

        for config in std::iter::once(&defaults).chain(regions.values()) {
            if !registry.contains(&config.kind) {
                return Err(CellarError::config(format!(
                    "unknown backend type '{}'",
                    config.kind
                )));
            }
        }

        Ok(Self::new(registry, defaults).with_regions(regions))
    }

    /// Default configuration used by [`CacheManager::get_default_cache`].
    pub fn defaults(&self) -> &BackendConfig {
        &self.defaults
    }

    /// Shared backend for `config`, opened on first use.
    pub fn backend_for(&self, config: &BackendConfig) -> Result<Arc<dyn CacheBackend>> {
        let mut backends = lock_map(&self.backends, "backend pool")?;
        let store_key = config.store_key();

        if let Some(backend) = backends.get(&store_key) {
            return Ok(Arc::clone(backend));
        }

        let backend = self.registry.create(config)?;
        backends.insert(store_key, Arc::clone(&backend));
        Ok(backend)
    }

    /// Cache `name` on `config`, memoized by name and normalized configuration.
    ///
    /// Repeated calls with the same arguments return the same `Arc`.
    pub fn get_cache(&self, name: &str, config: &BackendConfig) -> Result<Arc<Cache>> {
        let key = (name.to_string(), config.normalized_key());
        let mut caches = lock_map(&self.caches, "cache registry")?;

        if let Some(cache) = caches.get(&key) {
            return Ok(Arc::clone(cache));
        }

        let stale_after = config.lock_stale_after()?;
        let backend = self.backend_for(config)?;
        let namespace = NamespaceManager::new(name, backend).with_lock_stale_after(stale_after);
        let cache = Arc::new(Cache::new(name, namespace, config.expire_duration()));

        debug!("Created cache '{}' on '{}' backend", name, config.kind);
        caches.insert(key, Arc::clone(&cache));
        Ok(cache)
    }

    /// Cache `name` on the default configuration.
    pub fn get_default_cache(&self, name: &str) -> Result<Arc<Cache>> {
        self.get_cache(name, &self.defaults)
    }

    /// Cache `name` on a named region's configuration.
    pub fn get_cache_region(&self, name: &str, region: &str) -> Result<Arc<Cache>> {
        let config = self
            .regions
            .get(region)
            .ok_or_else(|| CellarError::config(format!("cache region '{}' is not configured", region)))?;
        self.get_cache(name, config)
    }

    /// Session store on `config`, sharing the pooled backend.
    ///
    /// A `timeout` option (seconds) expires sessions that were not accessed
    /// within that window.
    pub fn session_store(&self, config: &BackendConfig) -> Result<SessionStore> {
        let timeout = config.option_u64("timeout")?.map(Duration::from_secs);
        let backend = self.backend_for(config)?;
        Ok(SessionStore::new(backend).with_timeout(timeout))
    }

    /// Number of memoized caches.
    pub fn cache_count(&self) -> Result<usize> {
        Ok(lock_map(&self.caches, "cache registry")?.len())
    }

    /// Drop every memoized cache and pooled backend.
    ///
    /// Caches already handed out keep working on their own backend handle.
    pub fn clear_registry(&self) -> Result<()> {
        let dropped = {
            let mut caches = lock_map(&self.caches, "cache registry")?;
            let count = caches.len();
            caches.clear();
            count
        };
        lock_map(&self.backends, "backend pool")?.clear();

        debug!("Cleared cache registry ({} caches)", dropped);
        Ok(())
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_cache_is_memoized() {
        let manager = CacheManager::with_defaults();
        let config = BackendConfig::memory().with_expire(60);

        let a = manager.get_cache("test", &config).unwrap();
        let b = manager.get_cache("test", &config.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other_name = manager.get_cache("other", &config).unwrap();
        assert!(!Arc::ptr_eq(&a, &other_name));

        let other_expire = manager.get_cache("test", &BackendConfig::memory()).unwrap();
        assert!(!Arc::ptr_eq(&a, &other_expire));
        assert_eq!(manager.cache_count().unwrap(), 3);
    }

    #[test]
    fn test_caches_share_pooled_backend() {
        let manager = CacheManager::with_defaults();
        let short = manager
            .get_cache("shared", &BackendConfig::memory().with_expire(60))
            .unwrap();
        let forever = manager.get_cache("shared", &BackendConfig::memory()).unwrap();

        short.set_value("k", &"v").unwrap();
        assert_eq!(forever.get_value::<String>("k").unwrap(), "v");
    }

    #[test]
    fn test_unknown_type_fails_fast() {
        let manager = CacheManager::with_defaults();
        let err = manager
            .get_cache("x", &BackendConfig::new("ext:nonexistent"))
            .unwrap_err();
        assert!(matches!(err, CellarError::InvalidBackendConfiguration { .. }));

        let options = [("cache.type", "ext:nonexistent")];
        assert!(CacheManager::from_options("cache", &options).is_err());
    }

    #[test]
    fn test_regions_from_options() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("regions.sqlite").display().to_string();
        let options = vec![
            ("cache.regions".to_string(), "short,durable".to_string()),
            ("cache.short.expire".to_string(), "30".to_string()),
            ("cache.durable.type".to_string(), "sqlite".to_string()),
            ("cache.durable.url".to_string(), db),
        ];
        let manager = CacheManager::from_options("cache", &options).unwrap();

        let short = manager.get_cache_region("values", "short").unwrap();
        assert_eq!(short.expire(), Some(Duration::from_secs(30)));

        let durable = manager.get_cache_region("values", "durable").unwrap();
        assert_eq!(durable.namespace().backend().kind(), "sqlite");

        let err = manager.get_cache_region("values", "missing").unwrap_err();
        assert!(matches!(err, CellarError::InvalidBackendConfiguration { .. }));
    }

    #[test]
    fn test_clear_registry() {
        let manager = CacheManager::with_defaults();
        let before = manager.get_default_cache("test").unwrap();
        manager.clear_registry().unwrap();
        assert_eq!(manager.cache_count().unwrap(), 0);

        let after = manager.get_default_cache("test").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_session_store_timeout_option() {
        let manager = CacheManager::with_defaults();
        let bad = BackendConfig::memory().with_option("timeout", "soon").unwrap();
        assert!(manager.session_store(&bad).is_err());

        let good = BackendConfig::memory().with_option("timeout", "600").unwrap();
        let store = manager.session_store(&good).unwrap();
        assert_eq!(store.timeout(), Some(Duration::from_secs(600)));
    }
}
