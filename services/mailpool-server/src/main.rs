//! Mailpool server
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of shared email-API keys and its persisted state
//! 2. Rotates keys as the upstream reports them spent or revoked
//! 3. Exposes inbox and email operations to the UI as a local JSON API

mod api;
mod config;
mod error;
mod metrics;
mod notifications;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use key_pool::{EventSink, KeyPool, StoreRepository, SystemClock, spawn_rollover_task};
use mail_client::ApiClient;
use storage::{FileStore, KeyValueStore};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::ReqwestTransport;

use crate::api::AppState;
use crate::config::Config;
use crate::notifications::{NotificationLog, spawn_notification_logger};

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting mailpool-server");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        pool_keys = config.pool.keys.len(),
        mode = %config.client.mode,
        personal_key = config.client.personal_key.is_some(),
        "configuration loaded"
    );

    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(config.pool.state_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open state file {}",
                    config.pool.state_path.display()
                )
            })?,
    );

    let events = EventSink::default();
    let clock = Arc::new(SystemClock);
    let pool = Arc::new(
        KeyPool::load(
            config.pool.keys.clone(),
            config.policy(),
            Arc::new(StoreRepository::new(store.clone())),
            events.clone(),
            clock.clone(),
        )
        .await,
    );
    let rollover = spawn_rollover_task(pool.clone(), config.rollover_interval());

    let notifications = NotificationLog::default();
    let logger = spawn_notification_logger(&events, notifications.clone(), clock);

    let client_config = config
        .client_config()
        .context("invalid client configuration")?;
    let transport = Arc::new(ReqwestTransport::new(reqwest::Client::new()));
    let client = ApiClient::new(client_config, pool.clone(), transport, store)
        .await
        .context("failed to initialise API client")?;

    let app = api::build_router(
        AppState {
            client: client.clone(),
            notifications,
            prometheus: prometheus_handle,
            started_at: Instant::now(),
        },
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain deadline starts when the signal arrives, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    client.shutdown().await;
    rollover.abort();
    logger.abort();

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
