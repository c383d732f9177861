use redis::Client;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{RedisConfig, check_health};
use crate::common::{DatabaseResult, RetryConfig, retry, retry_with_backoff};

/// Open a [`ConnectionManager`] and verify it with `PING`.
///
/// The manager reconnects on its own after the initial handshake.
pub async fn connect(url: &str) -> DatabaseResult<ConnectionManager> {
    info!(url = %redact(url), "Connecting to Redis");

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    check_health(&mut manager.clone()).await?;

    info!("Connected to Redis");
    Ok(manager)
}

pub async fn connect_from_config(config: RedisConfig) -> DatabaseResult<ConnectionManager> {
    connect(&config.connection_url()).await
}

/// [`connect`] with exponential backoff; `None` uses [`RetryConfig::default`]
pub async fn connect_with_retry(
    url: &str,
    retry_config: Option<RetryConfig>,
) -> DatabaseResult<ConnectionManager> {
    match retry_config {
        Some(config) => retry_with_backoff(|| connect(url), config).await,
        None => retry(|| connect(url)).await,
    }
}

pub async fn connect_from_config_with_retry(
    config: RedisConfig,
    retry_config: Option<RetryConfig>,
) -> DatabaseResult<ConnectionManager> {
    let url = config.connection_url();
    connect_with_retry(&url, retry_config).await
}

/// Mask the password portion of a URL for logging
fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
            None => format!("{scheme}://{userinfo}@{host}"),
        },
        None => url.to_string(),
    }
}
