//! Cellar demo server.
//!
//! Serves a cache-backed counter and a session-backed counter over HTTP, with
//! sessions persisted to the configured backend.

use anyhow::Result;
use cellar::{BackendConfig, BackendRegistry, CacheManager};
use cellar_http::{start_server, CellarLayerState, SessionMiddlewareConfig, NO_SAVE_PREFIX};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cellar-demo")]
#[command(about = "Demo server for Cellar caches and sessions")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// SQLite database url (in-memory store when omitted)
    #[arg(long)]
    url: Option<String>,

    /// Cache entry lifetime in seconds
    #[arg(long)]
    expire: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Cellar demo server");

    let mut config = match args.url {
        Some(url) => BackendConfig::sqlite(url),
        None => BackendConfig::memory(),
    };
    config.expire = args.expire;
    info!("Using '{}' backend", config.kind);

    let manager = Arc::new(CacheManager::new(BackendRegistry::with_defaults(), config.clone()));
    let sessions = manager.session_store(&config)?;
    let state = CellarLayerState::new(manager, sessions).with_config(SessionMiddlewareConfig {
        no_save_prefixes: vec![NO_SAVE_PREFIX.to_string()],
        ..Default::default()
    });

    let addr = start_server(state, &args.host, args.port).await?;
    info!("Demo server running on http://{}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
