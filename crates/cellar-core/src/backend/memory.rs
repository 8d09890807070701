//! In-process memory store.
//!
//! Records live in a map guarded by a `RwLock`. Every cache created from the
//! same configuration shares one `MemoryStore` through the manager's backend
//! pool, so namespaces behave as they would on a shared database within a
//! single process.

use super::traits::{CacheBackend, NamespaceStats};
use crate::codec::StoredEntry;
use crate::error::{CellarError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Record {
    fields: BTreeMap<String, StoredEntry>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct HeldLock {
    owner: String,
    acquired: Instant,
}

/// Memory-backed document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Record>>,
    locks: Mutex<HashMap<String, HeldLock>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Record>>> {
        self.records
            .read()
            .map_err(|e| CellarError::unavailable(format!("Memory store poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Record>>> {
        self.records
            .write()
            .map_err(|e| CellarError::unavailable(format!("Memory store poisoned: {}", e)))
    }
}

impl CacheBackend for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn has_key(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .read()?
            .get(namespace)
            .is_some_and(|record| record.fields.contains_key(key)))
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
        Ok(self
            .read()?
            .get(namespace)
            .and_then(|record| record.fields.get(key))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, entry: &StoredEntry) -> Result<()> {
        let mut records = self.write()?;
        let record = records.entry(namespace.to_string()).or_default();
        record.fields.insert(key.to_string(), entry.clone());
        record.updated_at = Some(Utc::now());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let mut records = self.write()?;
        if let Some(record) = records.get_mut(namespace) {
            if record.fields.remove(key).is_some() {
                record.updated_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        self.write()?.remove(namespace);
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .get(namespace)
            .map(|record| record.fields.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn try_lock(&self, namespace: &str, owner: &str, stale_after: Duration) -> Result<bool> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| CellarError::unavailable(format!("Lock table poisoned: {}", e)))?;

        let available = match locks.get(namespace) {
            None => true,
            Some(held) => held.owner == owner || held.acquired.elapsed() > stale_after,
        };

        if available {
            locks.insert(
                namespace.to_string(),
                HeldLock {
                    owner: owner.to_string(),
                    acquired: Instant::now(),
                },
            );
        }

        Ok(available)
    }

    fn unlock(&self, namespace: &str, owner: &str) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| CellarError::unavailable(format!("Lock table poisoned: {}", e)))?;

        if locks.get(namespace).is_some_and(|held| held.owner == owner) {
            locks.remove(namespace);
        }
        Ok(())
    }

    fn namespace_stats(&self, namespace: &str) -> Result<Option<NamespaceStats>> {
        Ok(self.read()?.get(namespace).map(|record| NamespaceStats {
            namespace: namespace.to_string(),
            entry_count: record.fields.len(),
            total_size_bytes: record
                .fields
                .iter()
                .map(|(key, entry)| (key.len() + entry.size_hint()) as u64)
                .sum(),
            last_modified: record.updated_at,
        }))
    }
}
