//! Delivery processor for the stream worker.
//!
//! Turns one [`DeliveryRequest`] into player API calls:
//!
//! 1. load the channel record; anything but `active` is dropped
//! 2. list devices with the stored access token
//! 3. on 401, refresh the token, persist it and fail retryably so the
//!    redelivered request runs against the new token
//! 4. pick the first active `Computer` device; none means drop
//! 5. if the channel has preferences, look the track up and reject explicit
//!    or overlong tracks permanently
//! 6. enqueue the track on that device
//!
//! Terminal results are counted per channel: delivered, dropped, and failed
//! for permanent errors. Retryable failures are counted only by the dead
//! letter stream once they run out of attempts.
//!
//! A redelivery after a refresh can enqueue the same track twice if the first
//! enqueue succeeded but was reported as a failure. Requests carry no id to
//! deduplicate on, so at most one extra enqueue is accepted.

use async_trait::async_trait;
use std::sync::Arc;
use stream_worker::{ErrorCategory, StreamError, StreamProcessor};
use tracing::{error, info, instrument, warn};

use crate::error::{PlayerError, SongRequestError};
use crate::matcher::track_id;
use crate::models::{DeliveryRequest, DeliveryTally, Device, Preference};
use crate::player::PlayerApi;
use crate::store::ConnectionStore;

/// What happened to a request that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Queued { device_id: String },
    /// Channel is not `active`; no player calls were made
    SkippedInactive,
    /// No active computer to queue on
    NoDevice,
}

/// First active computer in list order
pub fn select_device(devices: &[Device]) -> Option<&Device> {
    devices
        .iter()
        .find(|device| device.is_active_computer() && device.id.is_some())
}

fn player_failure(context: &str, err: PlayerError) -> StreamError {
    match err {
        PlayerError::RateLimited => StreamError::rate_limited(format!("{}: rate limited", context)),
        other => StreamError::transient(format!("{}: {}", context, other)),
    }
}

pub struct DeliveryProcessor<S: ConnectionStore, P: PlayerApi> {
    store: Arc<S>,
    player: Arc<P>,
}

impl<S: ConnectionStore, P: PlayerApi> DeliveryProcessor<S, P> {
    pub fn new(store: S, player: P) -> Self {
        Self::with_arcs(Arc::new(store), Arc::new(player))
    }

    pub fn with_arcs(store: Arc<S>, player: Arc<P>) -> Self {
        Self { store, player }
    }

    #[instrument(skip(self, request), fields(channel_id = %request.channel_id, track_uri = %request.track_uri))]
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryOutcome, StreamError> {
        let connection = self
            .store
            .get(&request.channel_id)
            .await?
            .ok_or_else(|| SongRequestError::ConnectionNotFound(request.channel_id.clone()))?;

        if !connection.is_active() {
            info!(status = %connection.connection_status, "Channel not active, dropping request");
            return Ok(DeliveryOutcome::SkippedInactive);
        }

        let token = connection.player_token().ok_or_else(|| {
            SongRequestError::Session("channel has no player credentials".to_string())
        })?;

        let devices = match self.player.list_devices(&token.access_token).await {
            Ok(devices) => devices,
            Err(PlayerError::Unauthorized) => {
                return Err(self.refresh_and_redrive(request, &token.refresh_token).await);
            }
            Err(e) => return Err(player_failure("device list failed", e)),
        };

        let Some(device_id) = select_device(&devices).and_then(|d| d.id.clone()) else {
            warn!(devices = devices.len(), "No active computer device, dropping request");
            return Ok(DeliveryOutcome::NoDevice);
        };

        if let Some(preferences) = &connection.preferences {
            self.check_track(preferences, &token.access_token, &request.track_uri)
                .await?;
        }

        if let Err(e) = self
            .player
            .enqueue(&token.access_token, &device_id, &request.track_uri)
            .await
        {
            error!(device_id = %device_id, error = %e, "Failed to queue track");
            return Err(player_failure("enqueue failed", e));
        }

        info!(device_id = %device_id, "Queued track");
        Ok(DeliveryOutcome::Queued { device_id })
    }

    async fn check_track(
        &self,
        preferences: &Preference,
        access_token: &str,
        track_uri: &str,
    ) -> Result<(), StreamError> {
        let id = track_id(track_uri)
            .ok_or_else(|| StreamError::permanent(format!("not a track uri: {}", track_uri)))?;
        let track = self
            .player
            .track(access_token, id)
            .await
            .map_err(|e| player_failure("track lookup failed", e))?;

        preferences.check(&track).map_err(|rejection| {
            info!(reason = %rejection, "Track refused by channel preferences");
            StreamError::permanent(format!("track rejected: {}", rejection))
        })
    }

    /// Count a terminal result; the counter never fails the request
    async fn tally(&self, request: &DeliveryRequest, result: &Result<DeliveryOutcome, StreamError>) {
        let tally = match result {
            Ok(DeliveryOutcome::Queued { .. }) => DeliveryTally::Delivered,
            Ok(_) => DeliveryTally::Dropped,
            Err(e) if e.category() == ErrorCategory::Permanent => DeliveryTally::Failed,
            Err(_) => return,
        };

        if let Err(e) = self.store.record_delivery(&request.channel_id, tally).await {
            warn!(channel_id = %request.channel_id, error = %e, "Failed to count delivery");
        }
    }

    /// Refresh and persist the player token. Always returns the error to fail
    /// the request with: retryable after a refresh, fatal if refresh failed.
    async fn refresh_and_redrive(&self, request: &DeliveryRequest, refresh_token: &str) -> StreamError {
        let refreshed = match self.player.refresh_token(refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                error!(error = %e, "Player token refresh failed");
                return StreamError::fatal(format!("token refresh failed: {}", e));
            }
        };

        if let Err(e) = self
            .store
            .update_player_token(&request.channel_id, &refreshed)
            .await
        {
            error!(error = %e, "Failed to persist refreshed player token");
            return e.into();
        }

        info!("Player token refreshed, request will be redelivered");
        StreamError::transient("player token refreshed")
    }
}

#[async_trait]
impl<S, P> StreamProcessor<DeliveryRequest> for DeliveryProcessor<S, P>
where
    S: ConnectionStore + 'static,
    P: PlayerApi + 'static,
{
    async fn process(&self, request: &DeliveryRequest) -> Result<(), StreamError> {
        let result = self.deliver(request).await;
        self.tally(request, &result).await;
        result.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "DeliveryProcessor"
    }
}

impl<S: ConnectionStore, P: PlayerApi> Clone for DeliveryProcessor<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            player: Arc::clone(&self.player),
        }
    }
}
