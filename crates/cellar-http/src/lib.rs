//! Cellar HTTP - axum integration for Cellar caches and sessions.
//!
//! Provides a session middleware that loads and saves [`cellar::Session`]s
//! around each request, extractors for the session and the cache registry,
//! and the router used by the `cellar-demo` binary.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use error::HttpError;
pub use middleware::{
    session_middleware, CacheHandle, CellarLayerState, SessionHandle, SessionMiddlewareConfig,
};
pub use server::{build_router, start_server, NO_SAVE_PREFIX};
