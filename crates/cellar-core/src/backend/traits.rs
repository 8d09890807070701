//! Backend capability trait and shared types.

use crate::codec::StoredEntry;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata about a namespace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceStats {
    /// Namespace name.
    pub namespace: String,
    /// Number of fields currently held in the record.
    pub entry_count: usize,
    /// Approximate size of the record in bytes.
    pub total_size_bytes: u64,
    /// When the record was last modified, if the backend tracks it.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage capability behind a namespace.
///
/// A backend holds one record per namespace; each record maps encoded keys to
/// [`StoredEntry`] values. Keys passed to these methods are already encoded.
/// All operations are synchronous and each one is a single atomic step on the
/// backend, so concurrent writers to different keys of the same namespace never
/// lose each other's fields.
pub trait CacheBackend: Send + Sync {
    /// Backend type tag, e.g. `sqlite`.
    fn kind(&self) -> &'static str;

    /// Whether the field holds a well-formed entry, i.e. whether [`get`] would
    /// return `Some`.
    ///
    /// A missing record is a normal `false`, not an error.
    ///
    /// [`get`]: CacheBackend::get
    fn has_key(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Read a field.
    ///
    /// Returns `None` if the record or the field is missing, or if the field
    /// does not hold a well-formed entry.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>>;

    /// Create or overwrite a field, creating the record when absent.
    fn set(&self, namespace: &str, key: &str, entry: &StoredEntry) -> Result<()>;

    /// Delete one field. Removing an absent field is not an error.
    fn remove(&self, namespace: &str, key: &str) -> Result<()>;

    /// Delete the whole namespace record. Clearing an absent record is not an error.
    fn clear(&self, namespace: &str) -> Result<()>;

    /// Encoded keys currently present in the record.
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    /// Try once to take the advisory lock for `namespace` on behalf of `owner`.
    ///
    /// A lock held longer than `stale_after` is taken over. Returns whether the
    /// lock is now held by `owner`.
    fn try_lock(&self, namespace: &str, owner: &str, stale_after: Duration) -> Result<bool>;

    /// Release the advisory lock if `owner` still holds it.
    fn unlock(&self, namespace: &str, owner: &str) -> Result<()>;

    /// Metadata for a namespace, or `None` if it has no record.
    fn namespace_stats(&self, namespace: &str) -> Result<Option<NamespaceStats>>;
}
