//! Sessions stored as namespace records.
//!
//! A session lives in namespace `session:<id>` under a single field holding a
//! [`SessionDocument`]. Session data is written only by [`Session::save`], and
//! reading [`Session::id`] never persists anything. A store with a timeout
//! records the access time whenever it loads a session.

use crate::backend::CacheBackend;
use crate::codec;
use crate::config::SessionDefaults;
use crate::error::{CellarError, Result};
use crate::namespace::NamespaceManager;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Generate a new session id: 32 lowercase hex characters from the OS CSPRNG.
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; SessionDefaults::ID_BYTES]>())
}

/// Whether `id` has the shape of a generated session id.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == SessionDefaults::ID_BYTES * 2
        && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Id issued, nothing written.
    Unborn,
    /// Changed in memory since the last save or load.
    Dirty,
    /// Written by `save`.
    Persisted,
    /// Read back from the store by id.
    Loaded,
    /// Record deleted; the session cannot be saved again.
    Invalidated,
}

/// Persisted form of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl SessionDocument {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            data: Map::new(),
            created_at: now,
            accessed_at: now,
        }
    }
}

/// Entry point for creating and loading sessions.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn CacheBackend>,
    timeout: Option<Duration>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("backend", &self.backend.kind())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SessionStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            timeout: None,
        }
    }

    /// Treat sessions not accessed within `timeout` as gone.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn namespace_for(&self, id: &str) -> NamespaceManager {
        NamespaceManager::new(
            format!("{}{}", SessionDefaults::NAMESPACE_PREFIX, id),
            Arc::clone(&self.backend),
        )
    }

    /// Start a new session. No I/O happens until it is saved.
    pub fn new_session(&self) -> Session {
        Session {
            store: self.clone(),
            doc: SessionDocument::fresh(),
            state: SessionState::Unborn,
            is_new: true,
        }
    }

    /// Load a persisted session.
    ///
    /// Returns `None` when no such session exists, when it has timed out, or
    /// when `id` is not a well-formed session id. Never creates a record.
    ///
    /// With a timeout configured, the new access time is written back so that
    /// a session that is only read stays alive.
    pub fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        if !is_valid_id(id) {
            debug!("Ignoring malformed session id");
            return Ok(None);
        }

        let namespace = self.namespace_for(id);
        let entry = match namespace.get(SessionDefaults::DOCUMENT_KEY) {
            Ok(entry) => entry,
            Err(CellarError::KeyNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut doc: SessionDocument = match codec::decode_value(entry.value) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Session {} holds a malformed document: {}", id, e);
                return Ok(None);
            }
        };

        let now = Utc::now();
        if let Some(timeout) = self.timeout {
            let idle = (now - doc.accessed_at).to_std().unwrap_or(Duration::ZERO);
            if idle > timeout {
                debug!("Session {} timed out after {:?} idle", id, idle);
                return Ok(None);
            }
        }

        doc.accessed_at = now;
        if self.timeout.is_some() {
            namespace.set(SessionDefaults::DOCUMENT_KEY, codec::encode_value(&doc)?)?;
        }

        Ok(Some(Session {
            store: self.clone(),
            doc,
            state: SessionState::Loaded,
            is_new: false,
        }))
    }

    /// Delete a persisted session by id. Deleting an absent session is not an
    /// error.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.namespace_for(id).clear()
    }
}

/// One client's session.
#[derive(Clone)]
pub struct Session {
    store: SessionStore,
    doc: SessionDocument,
    state: SessionState,
    is_new: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.doc.id)
            .field("state", &self.state)
            .field("keys", &self.doc.data.len())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether this session was created in this context and never saved.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.state == SessionState::Dirty
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.doc.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.doc.accessed_at
    }

    /// The store this session belongs to.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == SessionState::Invalidated {
            return Err(CellarError::SessionInvalidated {
                id: self.doc.id.clone(),
            });
        }
        Ok(())
    }

    /// Typed read of `key`. `None` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.doc
            .data
            .get(key)
            .cloned()
            .map(codec::decode_value)
            .transpose()
    }

    /// Raw stored value of `key`.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.doc.data.get(key)
    }

    /// Set `key` in memory.
    pub fn insert<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        self.ensure_live()?;
        let encoded = codec::encode_value(value)?;
        self.doc.data.insert(key.to_string(), encoded);
        self.state = SessionState::Dirty;
        Ok(())
    }

    /// Remove `key` in memory, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        self.ensure_live()?;
        let previous = self.doc.data.remove(key);
        if previous.is_some() {
            self.state = SessionState::Dirty;
        }
        Ok(previous)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.doc.data.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.doc.data.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.data.is_empty()
    }

    /// Write the session document.
    pub fn save(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.doc.accessed_at = Utc::now();

        let encoded = codec::encode_value(&self.doc)?;
        self.store
            .namespace_for(&self.doc.id)
            .set(SessionDefaults::DOCUMENT_KEY, encoded)?;

        self.state = SessionState::Persisted;
        self.is_new = false;
        Ok(())
    }

    /// Delete the stored session. The session cannot be saved afterwards.
    pub fn delete(&mut self) -> Result<()> {
        self.store.delete(&self.doc.id)?;
        self.doc.data.clear();
        self.state = SessionState::Invalidated;
        Ok(())
    }

    /// Delete the stored session and continue as a fresh, unsaved one with a
    /// new id.
    pub fn invalidate(&mut self) -> Result<()> {
        self.store.delete(&self.doc.id)?;
        self.doc = SessionDocument::fresh();
        self.state = SessionState::Unborn;
        self.is_new = true;
        Ok(())
    }

    /// Load another persisted session from the same store.
    pub fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        self.store.get_by_id(id)
    }
}
