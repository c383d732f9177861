//! Song Requests Domain
//!
//! Turns channel point redemptions into tracks queued on the streamer's
//! media player.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │SubscriptionSupervisor│  ← one client per connected channel
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐
//! │  SubscriptionClient  │  ← PubSub websocket, PING/LISTEN, reconnect
//! └──────────┬───────────┘
//!            │ qualifying redemptions
//! ┌──────────▼───────────┐
//! │     Redis Stream     │  ← song_requests:deliveries
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐
//! │  DeliveryProcessor   │  ← devices, token refresh, enqueue
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐
//! │   Media player API   │
//! └──────────────────────┘
//! ```
//!
//! Channel records (status plus session credentials) are read through
//! [`ConnectionStore`] by both sides.

pub mod error;
pub mod handlers;
pub mod matcher;
pub mod models;
pub mod player;
pub mod processor;
pub mod publisher;
pub mod pubsub;
pub mod store;
pub mod streams;

pub use error::{PlayerError, SongRequestError, SongRequestResult, TrackRejection};
pub use handlers::control_router;
pub use models::{
    ChannelConnection, ConnectionStatus, DeliveryCounts, DeliveryRequest, DeliveryTally, Device,
    Preference, Session, TokenPair, TokenRefresh, Track,
};
pub use player::{PlayerApi, PlayerConfig, SpotifyClient};
pub use processor::{DeliveryOutcome, DeliveryProcessor, select_device};
pub use publisher::RequestPublisher;
pub use pubsub::{PubSubConfig, SubscriptionClient, SubscriptionSupervisor};
pub use store::{ConnectionStore, RedisConnectionStore};
pub use streams::SongRequestStream;
