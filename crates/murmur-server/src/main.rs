//! Murmur server binary — the relay and synchronization layer entry point.
//!
//! Starts an axum HTTP server with structured logging, local cache
//! initialization, optional remote replication, and graceful shutdown on
//! SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use murmur_identity::HttpIdentityProvider;
use murmur_server::registry::ConnectionRegistry;
use murmur_server::webhooks::ProcessedWebhookIds;
use murmur_server::{app, config, AppState};
use murmur_store::{
    initialize_persistence, HttpReplica, LocalCachePersister, RemoteReplicaPersister, TableStore,
};
use murmur_voice::HttpVoiceProvider;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("MURMUR_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize the local-first store and its persisters. The server is
    // not ready until the cache has loaded and both auto-saves are running.
    let store = Arc::new(TableStore::new());
    let local = LocalCachePersister::open(&config.cache.path)
        .expect("failed to open local cache — check cache.path in config");

    let remote = config.remote.as_ref().map(|remote| {
        RemoteReplicaPersister::new(Arc::new(HttpReplica::new(
            &remote.base_url,
            &remote.api_key,
        )))
    });

    initialize_persistence(&store, &local, remote.as_ref())
        .await
        .expect("failed to initialize persistence — the server cannot start without the cache");

    // External providers
    let identity = Arc::new(HttpIdentityProvider::new(
        &config.identity.base_url,
        &config.identity.secret_key,
    ));
    let voice = Arc::new(HttpVoiceProvider::new(
        &config.voice.base_url,
        &config.voice.api_key,
    ));

    let state = Arc::new(AppState {
        store,
        registry: ConnectionRegistry::new(),
        webhook_ids: ProcessedWebhookIds::new(),
        identity,
        voice,
        webhook_secret: config.identity.webhook_secret.clone(),
    });

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting murmur server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("murmur server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
