//! Cellar - namespace-based key-value caching and session storage.
//!
//! Every cache and session lives in a *namespace*: one record on a document
//! backend holding a field per key. Single-key writes are single atomic
//! statements on that record, so independent processes sharing a SQLite file
//! can write different keys of the same namespace without losing each other's
//! updates.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellar::{BackendConfig, CacheManager};
//!
//! fn main() -> cellar::Result<()> {
//!     let manager = CacheManager::with_defaults();
//!     let config = BackendConfig::sqlite("sqlite:///var/lib/app/cache.db").with_expire(3600);
//!
//!     let cache = manager.get_cache("pages", &config)?;
//!     cache.set_value("home", &"<h1>hi</h1>")?;
//!     let hits = cache.update_value("hits", 0u64, |n| n + 1)?;
//!     println!("{} hits", hits);
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod namespace;
pub mod session;

// Re-export commonly used types
pub use backend::{
    BackendRegistry, CacheBackend, MemoryStore, NamespaceStats, SqliteDocumentStore,
};
pub use cache::Cache;
pub use codec::{StoredEntry, MAX_KEY_BYTES};
pub use config::{BackendConfig, CacheDefaults, SessionDefaults};
pub use error::{CellarError, Result};
pub use manager::CacheManager;
pub use namespace::{NamespaceLock, NamespaceManager};
pub use session::{Session, SessionDocument, SessionState, SessionStore};
