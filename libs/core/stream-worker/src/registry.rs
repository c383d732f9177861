//! Stream registry types and definitions.
//!
//! This module provides:
//! - `StreamDef` trait for domain-specific queue definitions
//! - `StreamJob` / `StreamProcessor` traits implemented by domains
//! - `MessageKey` enum for the reserved entry field names

use crate::error::StreamError;
use crate::event::QueueMessage;
use async_trait::async_trait;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Reserved field names in stream entries.
///
/// `Body` and `ReceiveCount` appear on every queue entry; the rest are added
/// when an entry is dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum MessageKey {
    Body,
    ReceiveCount,
    Error,
    ErrorCategory,
    SourceId,
    FailedAt,
}

impl MessageKey {
    /// Keys that only exist on dead-lettered entries
    pub fn dlq_keys() -> Vec<String> {
        Self::iter()
            .filter(|k| !matches!(k, MessageKey::Body | MessageKey::ReceiveCount))
            .map(|k| k.to_string())
            .collect()
    }
}

/// Queue definition trait.
///
/// Each domain names its stream, consumer group and dead-letter stream here
/// so producers and workers agree on them.
///
/// ```rust,ignore
/// pub struct SongRequestStream;
///
/// impl StreamDef for SongRequestStream {
///     const STREAM_NAME: &'static str = "song_requests:deliveries";
///     const CONSUMER_GROUP: &'static str = "delivery_workers";
///     const DLQ_STREAM: &'static str = "song_requests:deliveries:dlq";
/// }
/// ```
pub trait StreamDef: Send + Sync {
    const STREAM_NAME: &'static str;
    const CONSUMER_GROUP: &'static str;
    const DLQ_STREAM: &'static str;

    /// Approximate MAXLEN applied on XADD
    const MAX_LENGTH: i64 = 100_000;

    /// Entries read per batch
    const BATCH_SIZE: usize = 10;

    /// Deliveries allowed before an entry is dead-lettered
    const MAX_RECEIVE_COUNT: u32 = 3;

    /// Pending entries idle this long are claimed from other consumers
    const CLAIM_IDLE_MS: u64 = 30_000;

    fn stream_name() -> &'static str {
        Self::STREAM_NAME
    }

    fn consumer_group() -> &'static str {
        Self::CONSUMER_GROUP
    }

    fn dlq_stream() -> &'static str {
        Self::DLQ_STREAM
    }
}

/// A job carried by a queue message.
///
/// Jobs map to and from a [`QueueMessage`] (body + string attributes) rather
/// than a serialized blob, so the wire format stays readable by other tools.
pub trait StreamJob: Send + Sync + Clone + std::fmt::Debug {
    /// ID for logs
    fn job_id(&self) -> String;

    fn to_message(&self) -> QueueMessage;

    /// Rejected messages are dead-lettered without being processed
    fn from_message(message: &QueueMessage) -> Result<Self, StreamError>;
}

/// Domain handler for jobs read from a stream.
///
/// Return `Ok(())` to acknowledge. Errors are redriven or dead-lettered
/// according to [`StreamError::category`].
#[async_trait]
pub trait StreamProcessor<J: StreamJob>: Send + Sync {
    async fn process(&self, job: &J) -> Result<(), StreamError>;

    /// Label used in logs and metrics
    fn name(&self) -> &'static str;
}
