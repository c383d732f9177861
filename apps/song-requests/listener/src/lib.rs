//! Song Requests Listener
//!
//! ## Architecture
//!
//! ```text
//! POST /channels/{id}/connect
//!   ↓
//! SubscriptionSupervisor ── one SubscriptionClient per channel
//!   ↓ (websocket, LISTEN channel-points-channel-v1.{id})
//! reward-redeemed + "Song Request" + spotify:track:…
//!   ↓ (StreamProducer)
//! Redis Stream (song_requests:deliveries)
//! ```
//!
//! Channels whose stored status is `active` or `starting` are resumed at
//! startup. On shutdown every subscription is closed without touching the
//! stored status, so the next instance picks them up again.

use axum::Router;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use database::redis::{RedisConfig, connect_from_config_with_retry};
use domain_song_requests::{
    PubSubConfig, RedisConnectionStore, SongRequestStream, SubscriptionSupervisor, control_router,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use stream_worker::{HealthState, StreamProducer, health_router, metrics};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Wraps the routes in the only HTTP middleware the listener uses.
fn with_request_tracing(router: Router) -> Router {
    router.layer(TraceLayer::new_for_http())
}

pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    metrics::init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, ?environment, "Starting song requests listener");

    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let pubsub_config = PubSubConfig::from_env().wrap_err("Failed to load PubSub configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let redis = connect_from_config_with_retry(redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let store = Arc::new(RedisConnectionStore::new(redis.clone()));
    let publisher = Arc::new(StreamProducer::from_stream_def::<SongRequestStream>(
        redis.clone(),
    ));
    info!(stream = %publisher.stream_name(), url = %pubsub_config.url, "Publishing song requests");

    let supervisor = SubscriptionSupervisor::new(store, publisher, pubsub_config);

    match supervisor.resume().await {
        Ok(resumed) => info!(resumed, "Resumed channel subscriptions"),
        // the control API can still connect channels one by one
        Err(e) => error!(error = %e, "Failed to resume channel subscriptions"),
    }

    let health_state = HealthState::from_stream_def::<SongRequestStream>(redis, name, version);
    let app = with_request_tracing(
        control_router(supervisor.clone()).merge(health_router(health_state)),
    );

    let addr = server_config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind listener to {}", addr))?;
    info!(address = %addr, "Control API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
        })
        .await
        .wrap_err("Control API server failed");

    supervisor.shutdown().await;
    info!("Song requests listener stopped");
    served
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
