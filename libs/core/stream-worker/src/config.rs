//! Worker configuration

use crate::registry::StreamDef;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Unique per process, auto-generated
    pub consumer_id: String,
    pub dlq_stream: String,
    /// Sorted set holding redriven messages until their backoff elapses
    pub delayed_set: String,
    /// Approximate MAXLEN for requeued and dead-lettered entries
    pub max_length: i64,
    pub batch_size: usize,
    /// XREADGROUP BLOCK in milliseconds; `None` polls
    pub block_timeout_ms: Option<u64>,
    /// Sleep between polls when not blocking
    pub poll_interval_ms: u64,
    /// Pending entries idle this long are claimed from other consumers
    pub claim_idle_ms: u64,
    /// Deliveries allowed before an entry is dead-lettered
    pub max_receive_count: u32,
    /// When false, exhausted entries are acknowledged and dropped
    pub enable_dlq: bool,
    /// When false, redriven messages are re-added at once
    pub retry_backoff: bool,
}

/// Delayed-redrive set for a stream
pub fn delayed_set_name(stream_name: &str) -> String {
    format!("{}:delayed", stream_name)
}

impl WorkerConfig {
    pub fn from_stream_def<S: StreamDef>() -> Self {
        Self {
            stream_name: S::STREAM_NAME.to_string(),
            consumer_group: S::CONSUMER_GROUP.to_string(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            dlq_stream: S::DLQ_STREAM.to_string(),
            delayed_set: delayed_set_name(S::STREAM_NAME),
            max_length: S::MAX_LENGTH,
            batch_size: S::BATCH_SIZE,
            block_timeout_ms: Some(5000),
            poll_interval_ms: 1000,
            claim_idle_ms: S::CLAIM_IDLE_MS,
            max_receive_count: S::MAX_RECEIVE_COUNT,
            enable_dlq: true,
            retry_backoff: true,
        }
    }

    pub fn new(stream_name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        Self {
            dlq_stream: format!("{}:dlq", stream_name),
            delayed_set: delayed_set_name(&stream_name),
            stream_name,
            consumer_group: consumer_group.into(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            max_length: 100_000,
            batch_size: 10,
            block_timeout_ms: Some(5000),
            poll_interval_ms: 1000,
            claim_idle_ms: 30_000,
            max_receive_count: 3,
            enable_dlq: true,
            retry_backoff: true,
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_dlq_stream(mut self, stream: impl Into<String>) -> Self {
        self.dlq_stream = stream.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// `None` or `Some(0)` switches to polling
    pub fn with_blocking(mut self, timeout_ms: Option<u64>) -> Self {
        self.block_timeout_ms = timeout_ms.filter(|ms| *ms > 0);
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn with_claim_idle_ms(mut self, idle_ms: u64) -> Self {
        self.claim_idle_ms = idle_ms;
        self
    }

    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count.max(1);
        self
    }

    pub fn with_dlq(mut self, enable: bool) -> Self {
        self.enable_dlq = enable;
        self
    }

    pub fn with_retry_backoff(mut self, enable: bool) -> Self {
        self.retry_backoff = enable;
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.block_timeout_ms.is_some()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("stream:jobs", "workers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeliveryStream;

    impl StreamDef for DeliveryStream {
        const STREAM_NAME: &'static str = "test:deliveries";
        const CONSUMER_GROUP: &'static str = "test_workers";
        const DLQ_STREAM: &'static str = "test:deliveries:dlq";
        const MAX_RECEIVE_COUNT: u32 = 5;
    }

    #[test]
    fn test_from_stream_def() {
        let config = WorkerConfig::from_stream_def::<DeliveryStream>();

        assert_eq!(config.stream_name, "test:deliveries");
        assert_eq!(config.consumer_group, "test_workers");
        assert_eq!(config.dlq_stream, "test:deliveries:dlq");
        assert_eq!(config.max_receive_count, 5);
        assert_eq!(config.batch_size, 10);
        assert!(config.consumer_id.starts_with("worker-"));
        assert!(config.is_blocking());
    }

    #[test]
    fn test_new_derives_dlq_and_delayed_names() {
        let config = WorkerConfig::new("orders", "billing");
        assert_eq!(config.dlq_stream, "orders:dlq");
        assert_eq!(config.delayed_set, "orders:delayed");
        assert!(config.retry_backoff);
    }

    #[test]
    fn test_builder_clamps() {
        let config = WorkerConfig::new("s", "g")
            .with_consumer_id("worker-1")
            .with_batch_size(0)
            .with_max_receive_count(0)
            .with_blocking(Some(0));

        assert_eq!(config.consumer_id, "worker-1");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_receive_count, 1);
        assert!(!config.is_blocking());
    }
}
