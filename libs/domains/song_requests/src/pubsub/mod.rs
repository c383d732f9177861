//! Streaming platform PubSub subscription.

mod client;
pub mod protocol;
mod supervisor;

pub use client::{ConnectionState, PubSubConfig, SubscriptionClient, SubscriptionEvent};
pub use protocol::{FrameAction, handle_frame, topic_for};
pub use supervisor::{ChannelStatus, ConnectOutcome, SubscriptionSupervisor};
