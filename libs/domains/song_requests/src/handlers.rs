//! Channel control API for the listener.
//!
//! - `POST /channels/{channel_id}/connect`
//! - `POST /channels/{channel_id}/disconnect`
//! - `GET  /channels/{channel_id}/status`
//! - `GET  /channels/{channel_id}/preferences`
//! - `PUT  /channels/{channel_id}/preferences`
//! - `GET  /channels/{channel_id}/deliveries`
//!
//! A changed reward id reaches a running subscription on its next reconnect.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use crate::error::{SongRequestError, SongRequestResult};
use crate::models::{DeliveryCounts, Preference};
use crate::pubsub::{ChannelStatus, ConnectOutcome, SubscriptionSupervisor};
use crate::publisher::RequestPublisher;
use crate::store::ConnectionStore;

type SharedSupervisor<S, R> = Arc<SubscriptionSupervisor<S, R>>;

/// 202 when a subscription was started, 200 when one was already running
async fn connect_channel<S, R>(
    State(supervisor): State<SharedSupervisor<S, R>>,
    Path(channel_id): Path<String>,
) -> SongRequestResult<(StatusCode, Json<ChannelStatus>)>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    let code = match supervisor.connect(&channel_id).await? {
        ConnectOutcome::Started => StatusCode::ACCEPTED,
        ConnectOutcome::AlreadyRunning => StatusCode::OK,
    };
    Ok((code, Json(supervisor.status(&channel_id).await?)))
}

async fn disconnect_channel<S, R>(
    State(supervisor): State<SharedSupervisor<S, R>>,
    Path(channel_id): Path<String>,
) -> SongRequestResult<Json<ChannelStatus>>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    supervisor.disconnect(&channel_id).await?;
    Ok(Json(supervisor.status(&channel_id).await?))
}

async fn channel_status<S, R>(
    State(supervisor): State<SharedSupervisor<S, R>>,
    Path(channel_id): Path<String>,
) -> SongRequestResult<Json<ChannelStatus>>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    Ok(Json(supervisor.status(&channel_id).await?))
}

/// Stored preferences, or the defaults when none were set
async fn get_preferences<S, R>(
    State(supervisor): State<SharedSupervisor<S, R>>,
    Path(channel_id): Path<String>,
) -> SongRequestResult<Json<Preference>>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    let connection = supervisor
        .store()
        .get(&channel_id)
        .await?
        .ok_or_else(|| SongRequestError::ConnectionNotFound(channel_id.clone()))?;
    Ok(Json(connection.preferences.unwrap_or_default()))
}

async fn put_preferences<S, R>(
    State(supervisor): State<SharedSupervisor<S, R>>,
    Path(channel_id): Path<String>,
    Json(preferences): Json<Preference>,
) -> SongRequestResult<Json<Preference>>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    supervisor
        .store()
        .set_preferences(&channel_id, &preferences)
        .await?;
    Ok(Json(preferences))
}

async fn delivery_counts<S, R>(
    State(supervisor): State<SharedSupervisor<S, R>>,
    Path(channel_id): Path<String>,
) -> SongRequestResult<Json<DeliveryCounts>>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    Ok(Json(supervisor.store().delivery_counts(&channel_id).await?))
}

pub fn control_router<S, R>(supervisor: SharedSupervisor<S, R>) -> Router
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    Router::new()
        .route("/channels/{channel_id}/connect", post(connect_channel::<S, R>))
        .route("/channels/{channel_id}/disconnect", post(disconnect_channel::<S, R>))
        .route("/channels/{channel_id}/status", get(channel_status::<S, R>))
        .route(
            "/channels/{channel_id}/preferences",
            get(get_preferences::<S, R>).put(put_preferences::<S, R>),
        )
        .route("/channels/{channel_id}/deliveries", get(delivery_counts::<S, R>))
        .with_state(supervisor)
}
