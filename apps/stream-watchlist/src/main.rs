//! Stream Watchlist Demo Binary
//!
//! Runs the watchlist and recovery controller against the in-process
//! loopback provider and serves health and metrics.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-watchlist
//! ```
//!
//! # Environment Variables
//!
//! - `WATCHLIST_ITEMS`: Comma-separated item names (default: IBM.N)
//! - `WATCHLIST_SERVICE`: Service name (default: `DIRECT_FEED`)
//! - `WATCHLIST_RESERVED_STREAM_IDS`: Reserved identifier ceiling (default: 4)
//! - `WATCHLIST_MAX_STREAM_ID`: Largest identifier (default: 2147483647)
//! - `WATCHLIST_RECONNECT_ATTEMPT_LIMIT`: 0 = unlimited (default: 0)
//! - `WATCHLIST_RECONNECT_MIN_DELAY_MS`: (default: 1000)
//! - `WATCHLIST_RECONNECT_MAX_DELAY_MS`: (default: 5000)
//! - `WATCHLIST_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stream_watchlist::infrastructure::telemetry;
use stream_watchlist::{
    ChannelTransport, DomainType, EventDispatcher, HealthServer, HealthServerState, LoggingListener,
    LoopbackFeed, ReconnectConfig, RecoveryController, ServiceRef, StreamKey, TransportListener,
    Watchlist, WatchlistConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Service id the loopback provider advertises for the configured service.
const LOOPBACK_SERVICE_ID: u16 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting stream watchlist");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = WatchlistConfig::from_env()?;
    log_config(&config);

    let service = std::env::var("WATCHLIST_SERVICE").unwrap_or_else(|_| "DIRECT_FEED".to_string());
    let items = std::env::var("WATCHLIST_ITEMS").unwrap_or_else(|_| "IBM.N".to_string());

    let shutdown_token = CancellationToken::new();

    // Wire the controller to the loopback provider
    let (transport, command_rx) = ChannelTransport::new(config.feed.event_channel_capacity);
    let watchlist = Arc::new(Watchlist::with_services(
        config.limits(),
        HashMap::from([(service.clone(), LOOPBACK_SERVICE_ID)]),
    ));
    let controller = Arc::new(RecoveryController::new(
        watchlist,
        Arc::new(transport.clone()),
        Arc::new(transport.clone()),
        Arc::new(LoggingListener),
        ReconnectConfig::from_settings(&config.reconnect),
    ));

    let listener: Arc<dyn TransportListener> = controller.clone();
    let (dispatcher, event_tx) = EventDispatcher::new(
        listener,
        transport,
        config.feed.event_channel_capacity,
        shutdown_token.clone(),
    );
    let dispatcher = dispatcher.with_resend_interval(config.feed.resend_interval);
    let feed = LoopbackFeed::new(command_rx, event_tx, shutdown_token.clone())
        .with_update_interval(Duration::from_secs(1));
    let feed_control = feed.control();

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&controller),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        let summary = dispatcher.run().await;
        tracing::info!(events = summary.events, "Dispatcher finished");
    });

    tokio::spawn(async move {
        if let Err(e) = feed.run().await {
            tracing::error!(error = %e, "Loopback feed error");
        }
    });

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Subscribe configured items; requests are held until the session is up
    let keys: Vec<StreamKey> = items
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| StreamKey::new(DomainType::MarketPrice, item, ServiceRef::name(&service)))
        .collect();

    match controller.subscribe_batch(keys) {
        Ok(ids) => tracing::info!(?ids, "Subscribed configured items"),
        Err(e) => tracing::error!(error = %e, "Failed to subscribe configured items"),
    }

    feed_control.connect().await?;

    tracing::info!("Stream watchlist ready");

    await_shutdown(shutdown_token).await;

    tracing::info!("Stream watchlist stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &WatchlistConfig) {
    tracing::info!(
        reserved_stream_ids = config.watchlist.reserved_stream_ids,
        max_stream_id = config.watchlist.max_stream_id,
        attempt_limit = config.reconnect.attempt_limit,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        min_delay_ms = config.reconnect.min_delay.as_millis(),
        max_delay_ms = config.reconnect.max_delay.as_millis(),
        multiplier = config.reconnect.multiplier,
        "Reconnect backoff"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
