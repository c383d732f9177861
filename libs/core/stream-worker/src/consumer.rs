//! Stream consumer for Redis operations
//!
//! Reads entries through a consumer group and returns them undecoded, so the
//! worker can dead-letter entries that fail to decode.
//!
//! Redriven messages with a backoff wait in a sorted set scored by due time
//! (epoch ms). [`StreamConsumer::promote_due`] moves due members back onto the
//! stream in one script call, so a member is never both re-added and kept.

use crate::config::WorkerConfig;
use crate::error::StreamError;
use crate::event::{QueueMessage, fields_from_map};
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::{AsyncCommands, RedisResult, Script};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Re-add up to ARGV[2] members due by ARGV[1] to the stream KEYS[2]
const PROMOTE_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    local ok, entry = pcall(cjson.decode, member)
    if ok and type(entry.fields) == 'table' and #entry.fields > 0 then
        redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*', unpack(entry.fields))
    end
    redis.call('ZREM', KEYS[1], member)
end
return #due
";

/// Sorted set member; `id` keeps identical messages distinct
#[derive(Debug, Serialize)]
struct DelayedEntry {
    id: String,
    /// Flattened `[key, value, key, value, ..]`
    fields: Vec<String>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One stream entry with its fields flattened to strings
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl From<StreamId> for RawEntry {
    fn from(entry: StreamId) -> Self {
        Self {
            fields: fields_from_map(&entry.map),
            id: entry.id,
        }
    }
}

#[derive(Clone)]
pub struct StreamConsumer {
    redis: ConnectionManager,
    config: WorkerConfig,
}

impl StreamConsumer {
    pub fn new(redis: ConnectionManager, config: WorkerConfig) -> Self {
        Self { redis, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Create the consumer group (and the stream) unless it already exists
    pub async fn init_consumer_group(&self) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    /// Entries delivered to this consumer but never acknowledged
    pub async fn read_pending(&self, count: usize) -> Result<Vec<RawEntry>, StreamError> {
        self.read_group("0", count, None).await
    }

    /// New entries, blocking up to the configured timeout when enabled
    pub async fn read_new(&self, count: usize) -> Result<Vec<RawEntry>, StreamError> {
        self.read_group(">", count, self.config.block_timeout_ms).await
    }

    async fn read_group(
        &self,
        start: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> Result<Vec<RawEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(count);

        if let Some(timeout) = block_ms {
            cmd.arg("BLOCK").arg(timeout);
        }

        cmd.arg("STREAMS").arg(&self.config.stream_name).arg(start);

        // nil when BLOCK expires with nothing to read
        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(RawEntry::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn ack(&self, stream_id: &str) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let _: i64 = redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(stream_id)
            .query_async(&mut conn)
            .await?;

        debug!(stream_id = %stream_id, "Acknowledged entry");
        Ok(())
    }

    /// Re-add a message to the source stream with the given receive count
    pub async fn requeue(
        &self,
        message: &QueueMessage,
        receive_count: u32,
    ) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.config.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_length)
            .arg("*");
        for (key, value) in message.to_fields(Some(receive_count)) {
            cmd.arg(key).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream_id = %id, receive_count, "Requeued entry");
        Ok(id)
    }

    /// Park a message until `delay_ms` from now, then [`Self::promote_due`] re-adds it
    pub async fn schedule(
        &self,
        message: &QueueMessage,
        receive_count: u32,
        delay_ms: u64,
    ) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();
        let entry = DelayedEntry {
            id: uuid::Uuid::new_v4().to_string(),
            fields: message
                .to_fields(Some(receive_count))
                .into_iter()
                .flat_map(|(key, value)| [key, value])
                .collect(),
        };
        let due_at = now_ms().saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX));

        let _: i64 = conn
            .zadd(&self.config.delayed_set, serde_json::to_string(&entry)?, due_at)
            .await?;
        debug!(receive_count, delay_ms, "Scheduled delayed redrive");
        Ok(())
    }

    /// Move due delayed messages onto the stream; returns how many moved
    pub async fn promote_due(&self, limit: usize) -> Result<usize, StreamError> {
        let mut conn = self.redis.clone();
        let moved: usize = Script::new(PROMOTE_DUE_SCRIPT)
            .key(&self.config.delayed_set)
            .key(&self.config.stream_name)
            .arg(now_ms())
            .arg(limit.max(1))
            .arg(self.config.max_length)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            debug!(count = moved, "Promoted delayed entries");
        }
        Ok(moved)
    }

    /// Messages waiting out a backoff
    pub async fn delayed_count(&self) -> Result<i64, StreamError> {
        let mut conn = self.redis.clone();
        let count: i64 = conn.zcard(&self.config.delayed_set).await?;
        Ok(count)
    }

    /// Take over entries other consumers left pending for longer than `claim_idle_ms`
    pub async fn claim_abandoned(&self, count: usize) -> Result<Vec<RawEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: Option<StreamAutoClaimReply> = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(self.config.claim_idle_ms)
            .arg("0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let entries: Vec<RawEntry> = reply
            .map(|reply| reply.claimed.into_iter().map(RawEntry::from).collect())
            .unwrap_or_default();

        if !entries.is_empty() {
            warn!(count = entries.len(), "Claimed abandoned entries");
        }
        Ok(entries)
    }

    /// Length and pending count for monitoring
    pub async fn stream_info(&self) -> Result<StreamInfo, StreamError> {
        let mut conn = self.redis.clone();

        let length: i64 = redis::cmd("XLEN")
            .arg(&self.config.stream_name)
            .query_async(&mut conn)
            .await?;

        let pending: RedisResult<(i64, Option<String>, Option<String>, Option<Vec<(String, i64)>>)> =
            redis::cmd("XPENDING")
                .arg(&self.config.stream_name)
                .arg(&self.config.consumer_group)
                .query_async(&mut conn)
                .await;

        Ok(StreamInfo {
            stream_name: self.config.stream_name.clone(),
            consumer_group: self.config.consumer_group.clone(),
            length,
            pending_count: pending.map(|(count, _, _, _)| count).unwrap_or(0),
            delayed_count: self.delayed_count().await?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_name: String,
    pub consumer_group: String,
    pub length: i64,
    pub pending_count: i64,
    pub delayed_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_delayed_entry_flattens_fields_in_order() {
        let message = QueueMessage::new("spotify:track:x").with_attribute("channelId", "42");
        let entry = DelayedEntry {
            id: "d-1".to_string(),
            fields: message
                .to_fields(Some(2))
                .into_iter()
                .flat_map(|(key, value)| [key, value])
                .collect(),
        };

        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json["fields"],
            serde_json::json!(["body", "spotify:track:x", "receiveCount", "2", "channelId", "42"])
        );
    }

    #[test]
    fn test_raw_entry_from_stream_id() {
        let mut map = HashMap::new();
        map.insert("body".to_string(), redis::Value::BulkString(b"spotify:track:x".to_vec()));
        map.insert("channelId".to_string(), redis::Value::BulkString(b"42".to_vec()));

        let entry = RawEntry::from(StreamId {
            id: "1-0".to_string(),
            map,
            ..Default::default()
        });

        assert_eq!(entry.id, "1-0");
        assert_eq!(entry.fields.get("channelId").map(String::as_str), Some("42"));
    }
}
