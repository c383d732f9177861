//! Song Requests Worker
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (song_requests:deliveries)
//!   ↓ (Consumer Group: delivery_workers)
//! StreamWorker<DeliveryRequest, DeliveryProcessor>
//!   ↓ record lookup, device list, token refresh on 401
//! Spotify Web API (POST /me/player/queue)
//! ```
//!
//! Failed deliveries are redriven up to `DELIVERY_MAX_RECEIVE_COUNT` times
//! and then parked in `song_requests:deliveries:dlq`, which can be inspected
//! and replayed through `/admin/dlq/*` on the health port.

use axum::Router;
use core_config::{ConfigError, Environment, FromEnv, env_parse_or};
use database::redis::{RedisConfig, connect_from_config_with_retry};
use domain_song_requests::{
    DeliveryProcessor, DeliveryRequest, PlayerConfig, RedisConnectionStore, SongRequestStream,
    SpotifyClient,
};
use eyre::{Result, WrapErr};
use stream_worker::{HealthState, StreamWorker, WorkerConfig, full_admin_router, metrics};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Queue settings from `SongRequestStream`, tuned by `DELIVERY_*` variables.
///
/// `DELIVERY_BLOCK_MS=0` switches the worker to polling.
pub fn worker_config_from_env() -> Result<WorkerConfig, ConfigError> {
    let defaults = WorkerConfig::from_stream_def::<SongRequestStream>();

    let batch_size = env_parse_or("DELIVERY_BATCH_SIZE", defaults.batch_size)?;
    let block_ms = env_parse_or("DELIVERY_BLOCK_MS", defaults.block_timeout_ms.unwrap_or(0))?;
    let max_receive_count =
        env_parse_or("DELIVERY_MAX_RECEIVE_COUNT", defaults.max_receive_count)?;

    Ok(defaults
        .with_batch_size(batch_size)
        .with_blocking(Some(block_ms))
        .with_max_receive_count(max_receive_count))
}

/// Serve health, metrics and DLQ admin routes
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = full_admin_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    metrics::init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, ?environment, "Starting song requests worker");

    let health_port: u16 =
        env_parse_or("HEALTH_PORT", 8082).wrap_err("Failed to load health port")?;
    let player_config = PlayerConfig::from_env().wrap_err("Failed to load player configuration")?;
    let worker_config = worker_config_from_env().wrap_err("Failed to load queue configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!(
        stream = %worker_config.stream_name,
        consumer_group = %worker_config.consumer_group,
        consumer_id = %worker_config.consumer_id,
        block_timeout_ms = ?worker_config.block_timeout_ms,
        batch_size = worker_config.batch_size,
        max_receive_count = worker_config.max_receive_count,
        "Worker configuration loaded"
    );

    info!("Connecting to Redis...");
    let redis = connect_from_config_with_retry(redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let processor = DeliveryProcessor::new(
        RedisConnectionStore::new(redis.clone()),
        SpotifyClient::new(player_config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::from_stream_def::<SongRequestStream>(redis.clone(), name, version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let worker = StreamWorker::<DeliveryRequest, _>::new(redis, processor, worker_config);
    worker
        .run(shutdown_rx)
        .await
        .wrap_err("Delivery worker failed")?;

    info!("Song requests worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
