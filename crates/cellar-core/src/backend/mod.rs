//! Storage backends for Cellar namespaces.
//!
//! A backend holds one document per namespace and exposes atomic per-field
//! operations on it:
//! - `sqlite` / `document`: a JSON document per row in a SQLite database,
//!   shared across processes
//! - `memory`: a process-local map, shared by every cache on the same
//!   configuration

mod memory;
mod registry;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use registry::{BackendFactory, BackendRegistry};
pub use sqlite::{DatabaseTarget, SqliteDocumentStore};
pub use traits::{CacheBackend, NamespaceStats};
