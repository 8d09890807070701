//! Error types for Cellar.
//!
//! Logical absence (`KeyNotFound`, `ValueNotFound`) is kept strictly apart from
//! infrastructural failures (`BackendUnavailable`, `Database`) so that callers
//! supplying a default never mask a store outage as "absent".

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Cellar library.
#[derive(Debug, Error)]
pub enum CellarError {
    // Logical absence
    #[error("Key not found in namespace {namespace}: {key}")]
    KeyNotFound { namespace: String, key: String },

    #[error("Value not found in cache {namespace}: {key}")]
    ValueNotFound { namespace: String, key: String },

    // Backend errors
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Configuration errors
    #[error("Invalid backend configuration: {message}")]
    InvalidBackendConfiguration { message: String },

    // Encoding errors
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Coordination errors
    #[error("Timed out after {waited:?} waiting for lock on namespace {namespace}")]
    LockTimeout { namespace: String, waited: Duration },

    #[error("Session {id} has been invalidated")]
    SessionInvalidated { id: String },
}

/// Result type alias for Cellar operations.
pub type Result<T> = std::result::Result<T, CellarError>;

impl From<std::io::Error> for CellarError {
    fn from(err: std::io::Error) -> Self {
        CellarError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CellarError {
    fn from(err: serde_json::Error) -> Self {
        CellarError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for CellarError {
    fn from(err: rusqlite::Error) -> Self {
        CellarError::from_sqlite(err.to_string(), err)
    }
}

impl CellarError {
    /// Classify a SQLite error, keeping busy/locked/unopenable databases apart
    /// from other store failures.
    pub fn from_sqlite(message: impl Into<String>, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let unavailable = matches!(
            err.sqlite_error_code(),
            Some(
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            )
        );

        if unavailable {
            CellarError::BackendUnavailable {
                message: message.into(),
                source: Some(err),
            }
        } else {
            CellarError::Database {
                message: message.into(),
                source: Some(err),
            }
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        CellarError::InvalidBackendConfiguration {
            message: message.into(),
        }
    }

    /// Create an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        CellarError::Encoding {
            message: message.into(),
        }
    }

    /// Create an unavailability error without an underlying driver error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        CellarError::BackendUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CellarError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error is a logical "not found" (absent or expired).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CellarError::KeyNotFound { .. } | CellarError::ValueNotFound { .. }
        )
    }

    /// Whether this error means the backing store could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CellarError::BackendUnavailable { .. } | CellarError::LockTimeout { .. }
        )
    }
}
