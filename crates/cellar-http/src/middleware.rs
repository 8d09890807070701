//! Session and cache middleware for axum.
//!
//! `session_middleware` resolves the caller's session before the handler runs
//! and writes it back afterwards:
//!
//! 1. Read the session id from the id header, then the session cookie
//! 2. Load the persisted session, or start an unsaved one
//! 3. Expose it (and the cache manager) to handlers through request extensions
//! 4. Save the session if the handler changed it, unless the path opts out
//! 5. Send a `Set-Cookie` when the client does not know the saved id yet
//!
//! # Example
//!
//! ```ignore
//! use axum::{middleware, Router};
//! use cellar_http::middleware::{session_middleware, CellarLayerState};
//!
//! let state = CellarLayerState::new(manager, sessions);
//! let app = Router::new()
//!     .route("/session", axum::routing::get(handler))
//!     .layer(middleware::from_fn_with_state(state, session_middleware));
//! ```

use crate::error::HttpError;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::SET_COOKIE, request::Parts, HeaderValue},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use cellar::{CacheManager, Session, SessionDefaults, SessionState, SessionStore};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Configuration for the session middleware.
#[derive(Debug, Clone)]
pub struct SessionMiddlewareConfig {
    /// Name of the session cookie.
    pub cookie_name: String,
    /// Optional header carrying a session id; wins over the cookie.
    pub id_header: Option<String>,
    /// Save changed sessions after the handler returns.
    pub auto_save: bool,
    /// Paths starting with one of these prefixes are never auto-saved.
    pub no_save_prefixes: Vec<String>,
    /// `Path` attribute of the session cookie.
    pub cookie_path: String,
}

impl Default for SessionMiddlewareConfig {
    fn default() -> Self {
        Self {
            cookie_name: SessionDefaults::COOKIE_NAME.to_string(),
            id_header: Some(SessionDefaults::ID_HEADER.to_string()),
            auto_save: true,
            no_save_prefixes: Vec::new(),
            cookie_path: "/".to_string(),
        }
    }
}

impl SessionMiddlewareConfig {
    fn skips_save(&self, path: &str) -> bool {
        !self.auto_save
            || self
                .no_save_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Shared state for the session middleware.
#[derive(Debug, Clone)]
pub struct CellarLayerState {
    /// Cache registry handed to handlers.
    pub manager: Arc<CacheManager>,
    /// Store sessions are loaded from and saved to.
    pub sessions: Arc<SessionStore>,
    /// Middleware configuration.
    pub config: Arc<SessionMiddlewareConfig>,
}

impl CellarLayerState {
    pub fn new(manager: Arc<CacheManager>, sessions: SessionStore) -> Self {
        Self {
            manager,
            sessions: Arc::new(sessions),
            config: Arc::new(SessionMiddlewareConfig::default()),
        }
    }

    pub fn with_config(mut self, config: SessionMiddlewareConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

/// The current request's session.
#[derive(Debug, Clone)]
pub struct SessionHandle(pub Arc<Mutex<Session>>);

impl SessionHandle {
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.0.lock().await
    }
}

/// The cache registry, available to every request behind the middleware.
#[derive(Debug, Clone)]
pub struct CacheHandle(pub Arc<CacheManager>);

impl std::ops::Deref for CacheHandle {
    type Target = CacheManager;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for SessionHandle
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<SessionHandle>().cloned().ok_or_else(|| {
            HttpError::Internal(
                "Session not found in request extensions. \
                 Ensure session_middleware is applied to this route."
                    .to_string(),
            )
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CacheHandle
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<CacheHandle>().cloned().ok_or_else(|| {
            HttpError::Internal(
                "Cache manager not found in request extensions. \
                 Ensure session_middleware is applied to this route."
                    .to_string(),
            )
        })
    }
}

fn incoming_session_id(request: &Request, config: &SessionMiddlewareConfig) -> Option<String> {
    let from_header = config.id_header.as_deref().and_then(|name| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    from_header.or_else(|| {
        CookieJar::from_headers(request.headers())
            .get(&config.cookie_name)
            .map(|cookie| cookie.value().to_string())
    })
}

/// Load the caller's session, run the handler, then persist the session.
pub async fn session_middleware(
    State(state): State<CellarLayerState>,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let incoming_id = incoming_session_id(&request, &state.config);

    let loaded = match incoming_id.clone() {
        Some(id) => {
            let store = Arc::clone(&state.sessions);
            tokio::task::spawn_blocking(move || store.get_by_id(&id)).await??
        }
        None => None,
    };
    let session = match loaded {
        Some(session) => session,
        None => {
            if incoming_id.is_some() {
                debug!("Unknown session id from client, issuing a new session");
            }
            state.sessions.new_session()
        }
    };

    let handle = Arc::new(Mutex::new(session));
    request
        .extensions_mut()
        .insert(SessionHandle(Arc::clone(&handle)));
    request
        .extensions_mut()
        .insert(CacheHandle(Arc::clone(&state.manager)));

    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let mut session = handle.lock().await;
    if session.is_dirty() && !state.config.skips_save(&path) {
        let mut snapshot = session.clone();
        let saved = tokio::task::spawn_blocking(move || snapshot.save().map(|_| snapshot)).await??;
        *session = saved;
        debug!("Saved session {}", session.id());
    }

    let cookie = match session.state() {
        SessionState::Persisted if incoming_id.as_deref() != Some(session.id()) => Some(
            Cookie::build((state.config.cookie_name.clone(), session.id().to_string()))
                .path(state.config.cookie_path.clone())
                .http_only(true)
                .build(),
        ),
        SessionState::Invalidated if incoming_id.is_some() => {
            let mut removal = Cookie::build((state.config.cookie_name.clone(), ""))
                .path(state.config.cookie_path.clone())
                .build();
            removal.make_removal();
            Some(removal)
        }
        _ => None,
    };

    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(&cookie.to_string())
            .map_err(|e| HttpError::Internal(format!("Invalid session cookie: {}", e)))?;
        response.headers_mut().append(SET_COOKIE, value);
    }

    Ok(response)
}
