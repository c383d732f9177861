//! Owns the `channelId -> subscription` map.
//!
//! Each connected channel gets its own [`SubscriptionClient`] task with its
//! own shutdown signal. Clients report `ListenSent` over a channel and the
//! supervisor persists the `active` status in response.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::client::{ConnectionState, PubSubConfig, SubscriptionClient, SubscriptionEvent};
use crate::error::{SongRequestError, SongRequestResult};
use crate::models::ConnectionStatus;
use crate::publisher::RequestPublisher;
use crate::store::ConnectionStore;

struct ChannelHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyRunning,
}

/// Stored status plus whether this process holds a live subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub channel_id: String,
    pub connection_status: ConnectionStatus,
    pub subscribed: bool,
}

pub struct SubscriptionSupervisor<S: ConnectionStore, R: RequestPublisher> {
    store: Arc<S>,
    publisher: Arc<R>,
    config: PubSubConfig,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl<S, R> SubscriptionSupervisor<S, R>
where
    S: ConnectionStore + 'static,
    R: RequestPublisher + 'static,
{
    /// Must be called inside a tokio runtime; spawns the event pump
    pub fn new(store: Arc<S>, publisher: Arc<R>, config: PubSubConfig) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(Arc::clone(&store), rx));

        Arc::new(Self {
            store,
            publisher,
            config,
            channels: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Start a subscription for a stored channel. Idempotent while one is running.
    #[instrument(skip(self))]
    pub async fn connect(&self, channel_id: &str) -> SongRequestResult<ConnectOutcome> {
        let mut channels = self.channels.lock().await;

        if let Some(handle) = channels.get(channel_id) {
            if !handle.task.is_finished() {
                debug!("Subscription already running");
                return Ok(ConnectOutcome::AlreadyRunning);
            }
        }

        let connection = self
            .store
            .get(channel_id)
            .await?
            .ok_or_else(|| SongRequestError::ConnectionNotFound(channel_id.to_string()))?;

        let token = match connection.streaming_token() {
            Some(token) => token.to_string(),
            None => {
                warn!("No streaming token stored, LISTEN will be rejected until one is");
                String::new()
            }
        };

        self.store
            .update_status(channel_id, ConnectionStatus::Starting)
            .await?;

        let client = SubscriptionClient::new(
            channel_id,
            token,
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
            self.events.clone(),
        );
        let state = client.state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(client.run(shutdown_rx));

        channels.insert(
            channel_id.to_string(),
            ChannelHandle {
                shutdown,
                state,
                task,
            },
        );

        info!("Subscription started");
        Ok(ConnectOutcome::Started)
    }

    /// Stop the channel's subscription and mark it `inactive`.
    ///
    /// Returns whether a subscription was running in this process.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, channel_id: &str) -> SongRequestResult<bool> {
        let handle = self.channels.lock().await.remove(channel_id);
        let was_running = handle.is_some();

        if let Some(handle) = handle {
            stop(channel_id, handle).await;
        }

        self.store
            .update_status(channel_id, ConnectionStatus::Inactive)
            .await?;

        info!(was_running, "Channel disconnected");
        Ok(was_running)
    }

    /// Reconnect every channel left `active` or `starting`, e.g. after a restart
    pub async fn resume(&self) -> SongRequestResult<usize> {
        let mut started = 0;

        for status in [ConnectionStatus::Active, ConnectionStatus::Starting] {
            for channel_id in self.store.list_by_status(status).await? {
                match self.connect(&channel_id).await {
                    Ok(ConnectOutcome::Started) => started += 1,
                    Ok(ConnectOutcome::AlreadyRunning) => {}
                    Err(e) => {
                        error!(channel_id = %channel_id, error = %e, "Failed to resume subscription")
                    }
                }
            }
        }

        info!(started, "Resumed subscriptions");
        Ok(started)
    }

    /// Stop all subscriptions, leaving stored statuses alone so `resume` picks them up
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ChannelHandle)> = self.channels.lock().await.drain().collect();
        info!(count = handles.len(), "Stopping subscriptions");

        for (channel_id, handle) in handles {
            stop(&channel_id, handle).await;
        }
    }

    pub async fn status(&self, channel_id: &str) -> SongRequestResult<ChannelStatus> {
        let connection = self
            .store
            .get(channel_id)
            .await?
            .ok_or_else(|| SongRequestError::ConnectionNotFound(channel_id.to_string()))?;

        let subscribed = self
            .channels
            .lock()
            .await
            .get(channel_id)
            .is_some_and(|h| *h.state.borrow() == ConnectionState::Subscribed);

        Ok(ChannelStatus {
            channel_id: connection.channel_id,
            connection_status: connection.connection_status,
            subscribed,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Channel ids with a subscription task in this process
    pub async fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn stop(channel_id: &str, handle: ChannelHandle) {
    let _ = handle.shutdown.send(true);
    if let Err(e) = handle.task.await {
        error!(channel_id = %channel_id, error = %e, "Subscription task panicked");
    }
}

/// Persist `active` when a client reports its LISTEN went out
async fn pump_events<S: ConnectionStore>(
    store: Arc<S>,
    mut events: mpsc::UnboundedReceiver<SubscriptionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            // a disconnect may land after the LISTEN went out; the store keeps it
            SubscriptionEvent::ListenSent { channel_id } => match store.mark_active(&channel_id).await {
                Ok(true) => debug!(channel_id = %channel_id, "Channel marked active"),
                Ok(false) => {
                    debug!(channel_id = %channel_id, "Channel disconnected, not marking active")
                }
                Err(SongRequestError::ConnectionNotFound(_)) => {
                    warn!(channel_id = %channel_id, "Channel record missing")
                }
                Err(e) => warn!(channel_id = %channel_id, error = %e, "Failed to mark channel active"),
            },
        }
    }
}
