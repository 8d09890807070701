//! Namespace-scoped access to a backend record.
//!
//! A [`NamespaceManager`] binds a namespace name to a backend and speaks in
//! logical keys: it encodes keys on the way in, decodes them on the way out and
//! turns an absent field into [`CellarError::KeyNotFound`].

use crate::backend::{BackendRegistry, CacheBackend, NamespaceStats};
use crate::codec::{self, StoredEntry};
use crate::config::{BackendConfig, CacheDefaults};
use crate::error::{CellarError, Result};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle to one namespace on one backend.
///
/// Cheap to clone; clones share the backend connection.
#[derive(Clone)]
pub struct NamespaceManager {
    namespace: String,
    backend: Arc<dyn CacheBackend>,
    lock_stale_after: Duration,
    lock_poll_interval: Duration,
}

impl fmt::Debug for NamespaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceManager")
            .field("namespace", &self.namespace)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl NamespaceManager {
    /// Bind `namespace` to an existing backend.
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
            lock_stale_after: CacheDefaults::LOCK_STALE_AFTER,
            lock_poll_interval: CacheDefaults::LOCK_POLL_INTERVAL,
        }
    }

    /// Open a dedicated backend for `config` and bind `namespace` to it.
    ///
    /// Fails eagerly on an unknown backend type or malformed options.
    pub fn from_config(
        namespace: impl Into<String>,
        config: &BackendConfig,
        registry: &BackendRegistry,
    ) -> Result<Self> {
        let backend = registry.create(config)?;
        Ok(Self::new(namespace, backend).with_lock_stale_after(config.lock_stale_after()?))
    }

    /// Override the age after which a held lock may be taken over.
    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    /// Namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Backend this namespace lives on.
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Whether `key` currently exists in the record.
    pub fn has_key(&self, key: &str) -> Result<bool> {
        let encoded = codec::encode_key(key)?;
        self.backend.has_key(&self.namespace, &encoded)
    }

    /// Read the entry stored under `key`.
    pub fn get(&self, key: &str) -> Result<StoredEntry> {
        let encoded = codec::encode_key(key)?;
        self.backend
            .get(&self.namespace, &encoded)?
            .ok_or_else(|| CellarError::KeyNotFound {
                namespace: self.namespace.clone(),
                key: key.to_string(),
            })
    }

    /// Store `value` under `key`, stamped with the current time.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_entry(key, &StoredEntry::new(value))
    }

    /// Store a prepared entry under `key`.
    pub fn set_entry(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let encoded = codec::encode_key(key)?;
        self.backend.set(&self.namespace, &encoded, entry)
    }

    /// Delete `key`. Deleting an absent key is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let encoded = codec::encode_key(key)?;
        self.backend.remove(&self.namespace, &encoded)
    }

    /// Delete the whole namespace record.
    pub fn clear(&self) -> Result<()> {
        self.backend.clear(&self.namespace)
    }

    /// Logical keys currently stored, in backend order.
    ///
    /// Fields that do not decode as keys (written out-of-band) are skipped.
    pub fn keys(&self) -> Result<Vec<String>> {
        let encoded = self.backend.keys(&self.namespace)?;
        Ok(encoded
            .into_iter()
            .filter_map(|key| match codec::decode_key(&key) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!("Skipping field in namespace '{}': {}", self.namespace, e);
                    None
                }
            })
            .collect())
    }

    /// Metadata about the namespace record.
    pub fn stats(&self) -> Result<Option<NamespaceStats>> {
        self.backend.namespace_stats(&self.namespace)
    }

    /// Take the advisory lock for this namespace, polling until `timeout`.
    pub fn acquire_lock(&self, timeout: Duration) -> Result<NamespaceLock> {
        let owner = hex::encode(rand::random::<[u8; 8]>());
        let started = Instant::now();

        loop {
            if self
                .backend
                .try_lock(&self.namespace, &owner, self.lock_stale_after)?
            {
                debug!(
                    "Acquired lock on namespace '{}' after {:?}",
                    self.namespace,
                    started.elapsed()
                );
                return Ok(NamespaceLock {
                    backend: Arc::clone(&self.backend),
                    namespace: self.namespace.clone(),
                    owner,
                    released: false,
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(CellarError::LockTimeout {
                    namespace: self.namespace.clone(),
                    waited,
                });
            }
            thread::sleep(self.lock_poll_interval.min(timeout - waited));
        }
    }

    /// Run `f` while holding the namespace lock.
    pub fn with_lock<T, F>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let lock = self.acquire_lock(timeout)?;
        let result = f()?;
        lock.release()?;
        Ok(result)
    }
}

/// Advisory lock on a namespace, released on drop.
pub struct NamespaceLock {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    owner: String,
    released: bool,
}

impl NamespaceLock {
    /// Namespace this lock guards.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Release the lock, reporting backend failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend.unlock(&self.namespace, &self.owner)
    }
}

impl fmt::Debug for NamespaceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceLock")
            .field("namespace", &self.namespace)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.backend.unlock(&self.namespace, &self.owner) {
            warn!(
                "Failed to release lock on namespace '{}': {}",
                self.namespace, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryStore, SqliteDocumentStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_namespace(name: &str) -> NamespaceManager {
        NamespaceManager::new(name, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_get_missing_is_key_not_found() {
        let ns = memory_namespace("test");
        let err = ns.get("absent").unwrap_err();
        assert!(matches!(err, CellarError::KeyNotFound { ref key, .. } if key == "absent"));
        assert!(!ns.has_key("absent").unwrap());
    }

    #[test]
    fn test_none_roundtrips_as_null() {
        let ns = memory_namespace("test");
        ns.set("x", Value::Null).unwrap();
        assert!(ns.has_key("x").unwrap());
        assert_eq!(ns.get("x").unwrap().value, Value::Null);
    }

    #[test]
    fn test_has_key_agrees_with_get_on_malformed_field() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("malformed.sqlite");
        let ns = NamespaceManager::new("ns", Arc::new(SqliteDocumentStore::open(&path).unwrap()));
        ns.set("good", json!(1)).unwrap();

        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute(
            r#"UPDATE cellar_documents SET data = json_set(data, '$."bad"', 42) WHERE id = 'ns'"#,
            [],
        )
        .unwrap();

        assert!(matches!(ns.get("bad"), Err(CellarError::KeyNotFound { .. })));
        assert!(!ns.has_key("bad").unwrap());
        assert!(ns.has_key("good").unwrap());
    }

    #[test]
    fn test_keys_are_decoded() {
        let ns = memory_namespace("test");
        ns.set("has space", json!(24)).unwrap();
        ns.set("hiŏ", json!(1)).unwrap();

        let mut keys = ns.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["has space".to_string(), "hiŏ".to_string()]);
    }

    #[test]
    fn test_two_managers_share_a_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ns.sqlite");
        let a = NamespaceManager::new("shared", Arc::new(SqliteDocumentStore::open(&path).unwrap()));
        let b = NamespaceManager::new("shared", Arc::new(SqliteDocumentStore::open(&path).unwrap()));

        a.set("from_a", json!("a")).unwrap();
        b.set("from_b", json!("b")).unwrap();

        assert!(b.has_key("from_a").unwrap());
        assert!(a.has_key("from_b").unwrap());

        a.clear().unwrap();
        assert!(!b.has_key("from_b").unwrap());
    }

    #[test]
    fn test_lock_timeout_and_release() {
        let ns = memory_namespace("locked");
        let held = ns.acquire_lock(Duration::from_millis(50)).unwrap();

        let err = ns.acquire_lock(Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, CellarError::LockTimeout { .. }));
        assert!(err.is_unavailable());

        held.release().unwrap();
        let again = ns.acquire_lock(Duration::from_millis(50)).unwrap();
        drop(again);
        assert!(ns.acquire_lock(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryStore::new());
        let patient = NamespaceManager::new("ns", Arc::clone(&backend))
            .with_lock_stale_after(Duration::from_millis(20));

        let abandoned = patient.acquire_lock(Duration::from_millis(50)).unwrap();
        std::mem::forget(abandoned);

        let lock = patient.acquire_lock(Duration::from_millis(500)).unwrap();
        assert_eq!(lock.namespace(), "ns");
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let ns = memory_namespace("ns");
        let result: Result<()> = ns.with_lock(Duration::from_millis(50), || {
            Err(CellarError::encoding("boom"))
        });
        assert!(result.is_err());
        assert!(ns.acquire_lock(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_from_config_rejects_unknown_type() {
        let registry = BackendRegistry::with_defaults();
        let err = NamespaceManager::from_config("ns", &BackendConfig::new("bogus"), &registry)
            .unwrap_err();
        assert!(matches!(err, CellarError::InvalidBackendConfiguration { .. }));
    }
}
