//! Stream producer for publishing queue messages
//!
//! ```rust,ignore
//! let producer = StreamProducer::from_stream_def::<SongRequestStream>(redis);
//! let entry_id = producer.send(&request).await?;
//! ```

use crate::error::StreamError;
use crate::event::QueueMessage;
use crate::registry::{StreamDef, StreamJob};
use redis::aio::ConnectionManager;
use tracing::debug;

#[derive(Clone)]
pub struct StreamProducer {
    redis: ConnectionManager,
    stream_name: String,
    max_length: i64,
}

impl StreamProducer {
    pub fn new(redis: ConnectionManager, stream_name: impl Into<String>) -> Self {
        Self {
            redis,
            stream_name: stream_name.into(),
            max_length: 100_000,
        }
    }

    /// Keeps the stream name and MAXLEN consistent with the worker
    pub fn from_stream_def<S: StreamDef>(redis: ConnectionManager) -> Self {
        Self {
            redis,
            stream_name: S::STREAM_NAME.to_string(),
            max_length: S::MAX_LENGTH,
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Publish a job, returning the stream entry id
    pub async fn send<J: StreamJob>(&self, job: &J) -> Result<String, StreamError> {
        self.send_message(&job.to_message()).await
    }

    /// XADD with MAXLEN ~ and no receive count (first delivery)
    pub async fn send_message(&self, message: &QueueMessage) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*");
        for (key, value) in message.to_fields(None) {
            cmd.arg(key).arg(value);
        }

        let stream_id: String = cmd.query_async(&mut conn).await?;

        debug!(
            stream = %self.stream_name,
            stream_id = %stream_id,
            attributes = message.attributes.len(),
            "Published message"
        );

        Ok(stream_id)
    }
}
