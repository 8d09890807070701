//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cellar::CellarError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Errors returned by the middleware and handlers.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Cellar(#[from] CellarError),

    #[error("{0}")]
    NotFound(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Internal(String),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::Cellar(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            HttpError::Cellar(e) if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        match status {
            StatusCode::NOT_FOUND => {}
            StatusCode::SERVICE_UNAVAILABLE => warn!("Request failed: {}", self),
            _ => error!("Request failed: {}", self),
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
