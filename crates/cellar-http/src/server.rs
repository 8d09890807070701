//! HTTP server implementation using Axum.

use crate::handlers::{
    handle_clear, handle_counter, handle_health, handle_session, handle_session_by_id,
};
use crate::middleware::{session_middleware, CellarLayerState};
use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Prefix of routes whose session changes are never saved.
pub const NO_SAVE_PREFIX: &str = "/nosave";

/// Build the demo router with the session middleware applied.
pub fn build_router(state: CellarLayerState) -> Router {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/counter", get(handle_counter))
        .route("/session", get(handle_session))
        .route("/session/:id", get(handle_session_by_id))
        .route("/nosave/session", get(handle_session))
        .route("/clear", get(handle_clear).post(handle_clear))
        .layer(middleware::from_fn_with_state(state, session_middleware))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Start the demo HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(state: CellarLayerState, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let app = build_router(state);

    // Parse the address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    // Bind to the address
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar::{BackendConfig, CacheManager};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_server_starts() {
        let manager = Arc::new(CacheManager::with_defaults());
        let sessions = manager.session_store(&BackendConfig::memory()).unwrap();
        let state = CellarLayerState::new(manager, sessions);

        let addr = start_server(state, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }
}
