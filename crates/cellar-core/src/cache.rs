//! Cache façade over a namespace with lazy expiration.

use crate::codec::{self, StoredEntry};
use crate::config::CacheDefaults;
use crate::error::{CellarError, Result};
use crate::namespace::NamespaceManager;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// A named cache: typed values, optional expiration, one namespace.
///
/// Entries older than `expire` read as absent but stay in the record until they
/// are overwritten, removed, cleared or purged.
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    namespace: NamespaceManager,
    expire: Option<Duration>,
    lock_timeout: Duration,
}

impl Cache {
    /// Create a cache over `namespace`. `expire` of `None` means entries never
    /// expire.
    pub fn new(name: impl Into<String>, namespace: NamespaceManager, expire: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            namespace,
            expire,
            lock_timeout: CacheDefaults::LOCK_TIMEOUT,
        }
    }

    /// Override how long compound operations wait for the namespace lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expire(&self) -> Option<Duration> {
        self.expire
    }

    pub fn namespace(&self) -> &NamespaceManager {
        &self.namespace
    }

    fn fresh_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
        match self.namespace.get(key) {
            Ok(entry) if entry.is_expired(self.expire, Utc::now()) => {
                debug!("Entry '{}' in cache '{}' has expired", key, self.name);
                Ok(None)
            }
            Ok(entry) => Ok(Some(entry)),
            Err(CellarError::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn not_found(&self, key: &str) -> CellarError {
        CellarError::ValueNotFound {
            namespace: self.namespace.namespace().to_string(),
            key: key.to_string(),
        }
    }

    /// Whether a fresh value is stored under `key`.
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.fresh_entry(key)?.is_some())
    }

    /// Read the value under `key`, failing with `ValueNotFound` when it is
    /// absent or expired.
    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let entry = self.fresh_entry(key)?.ok_or_else(|| self.not_found(key))?;
        codec::decode_value(entry.value)
    }

    /// Read the value under `key`, or `default` when it is absent or expired.
    ///
    /// Backend failures are still returned as errors.
    pub fn get_value_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.get_value(key) {
            Err(e) if e.is_not_found() => Ok(default),
            other => other,
        }
    }

    /// Store `value` under `key`, refreshing its timestamp.
    pub fn set_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = codec::encode_value(value)?;
        self.namespace.set(key, encoded)
    }

    /// Delete `key`. Deleting an absent key is not an error.
    pub fn remove_value(&self, key: &str) -> Result<()> {
        self.namespace.remove(key)
    }

    /// Delete every entry of the cache.
    pub fn clear(&self) -> Result<()> {
        self.namespace.clear()
    }

    /// Return the fresh value under `key`, or create it with `create`, store it
    /// and return it.
    ///
    /// Creation runs under the namespace lock so concurrent callers compute the
    /// value once.
    pub fn get_or_insert_with<T, F>(&self, key: &str, create: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if let Some(entry) = self.fresh_entry(key)? {
            return codec::decode_value(entry.value);
        }

        self.namespace.with_lock(self.lock_timeout, || {
            if let Some(entry) = self.fresh_entry(key)? {
                return codec::decode_value(entry.value);
            }
            debug!("Creating value for '{}' in cache '{}'", key, self.name);
            let value = create()?;
            self.set_value(key, &value)?;
            Ok(value)
        })
    }

    /// Read-modify-write `key` under the namespace lock.
    ///
    /// `update` receives the current value, or `default` when absent or
    /// expired. Returns the stored result.
    pub fn update_value<T, F>(&self, key: &str, default: T, update: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.namespace.with_lock(self.lock_timeout, || {
            let current = self.get_value_or(key, default)?;
            let next = update(current);
            self.set_value(key, &next)?;
            Ok(next)
        })
    }

    /// Logical keys holding fresh values.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut fresh = Vec::new();
        for key in self.namespace.keys()? {
            if self.fresh_entry(&key)?.is_some() {
                fresh.push(key);
            }
        }
        Ok(fresh)
    }

    /// Physically delete expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        if self.expire.is_none() {
            return Ok(0);
        }

        self.namespace.with_lock(self.lock_timeout, || {
            let now = Utc::now();
            let mut purged = 0;
            for key in self.namespace.keys()? {
                let expired = match self.namespace.get(&key) {
                    Ok(entry) => entry.is_expired(self.expire, now),
                    Err(CellarError::KeyNotFound { .. }) => false,
                    Err(e) => return Err(e),
                };
                if expired {
                    self.namespace.remove(&key)?;
                    purged += 1;
                }
            }

            debug!("Purged {} expired entries from cache '{}'", purged, self.name);
            Ok(purged)
        })
    }
}
