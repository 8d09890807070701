//! Demo request handlers.

use crate::error::HttpError;
use crate::middleware::{CacheHandle, SessionHandle};
use axum::{extract::Path, response::IntoResponse, Json};
use serde_json::json;
use tracing::debug;

/// Cache that backs the `/counter` route.
pub const COUNTER_CACHE: &str = "counter";

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Increment a counter held in the default cache.
pub async fn handle_counter(CacheHandle(manager): CacheHandle) -> Result<impl IntoResponse, HttpError> {
    let value = tokio::task::spawn_blocking(move || {
        let cache = manager.get_default_cache(COUNTER_CACHE)?;
        cache.update_value("value", 0i64, |n| n + 1)
    })
    .await??;

    Ok(Json(json!({ "value": value })))
}

/// Increment a counter held in the caller's session.
pub async fn handle_session(session: SessionHandle) -> Result<impl IntoResponse, HttpError> {
    let mut session = session.lock().await;
    let value = session.get::<i64>("value")?.unwrap_or(0) + 1;
    session.insert("value", &value)?;

    Ok(Json(json!({ "id": session.id(), "value": value })))
}

/// Adopt another session by id and increment its counter.
///
/// The adopted session is saved here; the caller's own session is untouched.
pub async fn handle_session_by_id(
    session: SessionHandle,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let store = session.lock().await.store().clone();

    let lookup = id.clone();
    let value = tokio::task::spawn_blocking(move || -> Result<Option<i64>, HttpError> {
        let Some(mut adopted) = store.get_by_id(&lookup)? else {
            return Ok(None);
        };
        let value = adopted.get::<i64>("value")?.unwrap_or(0) + 1;
        adopted.insert("value", &value)?;
        adopted.save()?;
        Ok(Some(value))
    })
    .await??;

    match value {
        Some(value) => Ok(Json(json!({ "id": id, "value": value }))),
        None => {
            debug!("Adoption of unknown session requested");
            Err(HttpError::NotFound(format!("No session id of {} found.", id)))
        }
    }
}

/// Reset the demo counter.
pub async fn handle_clear(CacheHandle(manager): CacheHandle) -> Result<impl IntoResponse, HttpError> {
    tokio::task::spawn_blocking(move || manager.get_default_cache(COUNTER_CACHE)?.clear()).await??;

    Ok(Json(json!({ "cleared": true })))
}
