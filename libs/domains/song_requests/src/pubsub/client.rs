//! Per-channel PubSub subscription client.
//!
//! One client owns one websocket. After connecting it sends a PING and a
//! LISTEN for the channel's redemption topic, then pings every heartbeat
//! interval and forwards qualifying redemptions to the queue. Errors, closes
//! and `RECONNECT` directives all lead to a new connection after the
//! reconnect delay, until the shutdown signal fires.

use core_config::{ConfigError, FromEnv, env_or_default, env_parse_or};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, instrument, warn};

use super::protocol::{FrameAction, OutboundFrame, handle_frame};
use crate::error::{SongRequestError, SongRequestResult};
use crate::models::DeliveryRequest;
use crate::publisher::RequestPublisher;
use crate::store::ConnectionStore;

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// Upper bound on the TCP, TLS and websocket handshake
    pub connect_timeout: Duration,
}

impl PubSubConfig {
    pub const DEFAULT_URL: &'static str = "wss://pubsub-edge.twitch.tv";

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_URL)
    }
}

impl FromEnv for PubSubConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_or_default("TWITCH_PUBSUB_URL", Self::DEFAULT_URL),
            heartbeat_interval: env_secs("PUBSUB_HEARTBEAT_SECS", 60)?,
            reconnect_delay: env_secs("PUBSUB_RECONNECT_SECS", 3)?,
            connect_timeout: env_secs("PUBSUB_CONNECT_TIMEOUT_SECS", 10)?,
        })
    }
}

/// A zero interval would spin the reconnect loop or panic the heartbeat timer
fn env_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    match env_parse_or(key, default)? {
        0 => Err(ConfigError::ParseError {
            key: key.to_string(),
            details: "must be at least 1 second".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// LISTEN sent; the server may still reject it
    Subscribed,
}

/// Messages from clients to their supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    ListenSent { channel_id: String },
}

/// Why one connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    ReconnectRequested,
    Closed,
}

pub struct SubscriptionClient<S: ConnectionStore, R: RequestPublisher> {
    channel_id: String,
    token: String,
    custom_reward_id: Option<String>,
    config: PubSubConfig,
    store: Arc<S>,
    publisher: Arc<R>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl<S, R> SubscriptionClient<S, R>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    pub fn new(
        channel_id: impl Into<String>,
        token: impl Into<String>,
        config: PubSubConfig,
        store: Arc<S>,
        publisher: Arc<R>,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            channel_id: channel_id.into(),
            token: token.into(),
            custom_reward_id: None,
            config,
            store,
            publisher,
            state,
            events,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Keep the channel subscribed until `shutdown` flips to `true`
    #[instrument(skip_all, fields(channel_id = %self.channel_id))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting subscription client");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.reload_token().await;
            self.state.send_replace(ConnectionState::Connecting);

            let end = self.open(&mut shutdown).await;
            self.state.send_replace(ConnectionState::Disconnected);

            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ReconnectRequested) => info!("Server requested reconnect"),
                Ok(SessionEnd::Closed) => info!("Connection closed"),
                Err(e) => warn!(error = %e, "Connection failed"),
            }

            debug!(delay_ms = self.config.reconnect_delay.as_millis(), "Reconnecting after delay");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("Subscription client stopped");
    }

    /// Pick up a token refreshed by the authorization flow since the last
    /// attempt, and the current reward preference
    async fn reload_token(&mut self) {
        match self.store.get(&self.channel_id).await {
            Ok(Some(connection)) => {
                if let Some(token) = connection.streaming_token() {
                    self.token = token.to_string();
                }
                self.custom_reward_id = connection
                    .preferences
                    .as_ref()
                    .and_then(|p| p.reward_id())
                    .map(str::to_string);
            }
            Ok(None) => warn!("Channel record missing, keeping last token"),
            Err(e) => warn!(error = %e, "Failed to reload token, keeping last token"),
        }
    }

    /// One connection: handshake, then heartbeat and frame handling until it ends
    async fn open(&self, shutdown: &mut watch::Receiver<bool>) -> SongRequestResult<SessionEnd> {
        let Some(ws) = self.connect(shutdown).await? else {
            return Ok(SessionEnd::Shutdown);
        };
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(OutboundFrame::Ping.to_json().into())).await?;
        sink.send(Message::Text(
            OutboundFrame::listen(&self.channel_id, &self.token).to_json().into(),
        ))
        .await?;

        self.state.send_replace(ConnectionState::Subscribed);
        if self
            .events
            .send(SubscriptionEvent::ListenSent {
                channel_id: self.channel_id.clone(),
            })
            .is_err()
        {
            debug!("Supervisor gone, LISTEN not reported");
        }
        info!("LISTEN sent");

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = sink.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ = heartbeat.tick() => {
                    debug!("PING");
                    sink.send(Message::Text(OutboundFrame::Ping.to_json().into())).await?;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match handle_frame(&self.channel_id, self.custom_reward_id.as_deref(), text.as_str()) {
                        FrameAction::Reconnect => {
                            let _ = sink.close().await;
                            return Ok(SessionEnd::ReconnectRequested);
                        }
                        FrameAction::Deliver(request) => self.publish(request).await,
                        FrameAction::Ignore => {}
                    },
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// Handshake bounded by the connect timeout; `None` when shutdown fires first
    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SongRequestResult<Option<WebSocketStream<MaybeTlsStream<TcpStream>>>> {
        debug!(url = %self.config.url, "Connecting");
        let handshake = timeout(self.config.connect_timeout, connect_async(self.config.url.as_str()));
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    let (ws, _response) = result.map_err(|_| {
                        SongRequestError::Transport(format!(
                            "handshake timed out after {}ms",
                            self.config.connect_timeout.as_millis()
                        ))
                    })??;
                    return Ok(Some(ws));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Shutdown during handshake");
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Best effort; the queue's own guarantees start once the publish lands
    async fn publish(&self, request: DeliveryRequest) {
        match self.publisher.publish(&request).await {
            Ok(message_id) => info!(
                track_uri = %request.track_uri,
                message_id = %message_id,
                "Song request queued"
            ),
            Err(e) => error!(
                track_uri = %request.track_uri,
                error = %e,
                "Failed to publish song request"
            ),
        }
    }
}
