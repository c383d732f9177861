//! Dead Letter Queue (DLQ) management
//!
//! Dead-lettered entries keep their original fields and gain `error`,
//! `errorCategory`, `sourceId` and `failedAt`. Reprocessing strips those and
//! re-adds the message to the source stream as a first delivery.

use crate::error::{ErrorCategory, StreamError};
use crate::event::QueueMessage;
use crate::registry::MessageKey;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::consumer::RawEntry;

#[derive(Clone)]
pub struct DlqManager {
    redis: ConnectionManager,
    source_stream: String,
    dlq_stream: String,
    max_length: i64,
}

impl DlqManager {
    pub fn new(
        redis: ConnectionManager,
        source_stream: impl Into<String>,
        dlq_stream: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            source_stream: source_stream.into(),
            dlq_stream: dlq_stream.into(),
            max_length: 10_000,
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }

    /// Copy an entry's fields into the DLQ with failure metadata
    pub async fn move_to_dlq(
        &self,
        entry: &RawEntry,
        error: &str,
        category: ErrorCategory,
    ) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.dlq_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*");

        let dlq_keys = MessageKey::dlq_keys();
        for (key, value) in entry.fields.iter().filter(|(k, _)| !dlq_keys.contains(k)) {
            cmd.arg(key).arg(value);
        }
        cmd.arg(MessageKey::Error.as_ref())
            .arg(error)
            .arg(MessageKey::ErrorCategory.as_ref())
            .arg(category.as_str())
            .arg(MessageKey::SourceId.as_ref())
            .arg(&entry.id)
            .arg(MessageKey::FailedAt.as_ref())
            .arg(Utc::now().to_rfc3339());

        let dlq_id: String = cmd.query_async(&mut conn).await?;

        info!(
            source_id = %entry.id,
            dlq_id = %dlq_id,
            error = %error,
            "Moved entry to DLQ"
        );

        Ok(dlq_id)
    }

    pub async fn stats(&self) -> Result<DlqStats, StreamError> {
        let mut conn = self.redis.clone();

        let length: i64 = redis::cmd("XLEN")
            .arg(&self.dlq_stream)
            .query_async(&mut conn)
            .await?;

        let oldest: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let newest: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(&self.dlq_stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(DlqStats {
            stream_name: self.dlq_stream.clone(),
            source_stream: self.source_stream.clone(),
            length,
            oldest_entry_id: oldest.ids.into_iter().next().map(|e| e.id),
            newest_entry_id: newest.ids.into_iter().next().map(|e| e.id),
        })
    }

    /// Oldest first, skipping `offset` entries
    pub async fn list_messages(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DlqMessage>, StreamError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(offset + limit)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .skip(offset)
            .map(|entry| DlqMessage::from(RawEntry::from(entry)))
            .collect())
    }

    pub async fn get(&self, dlq_id: &str) -> Result<Option<DlqMessage>, StreamError> {
        Ok(self.fetch(dlq_id).await?.map(DlqMessage::from))
    }

    async fn fetch(&self, dlq_id: &str) -> Result<Option<RawEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg(dlq_id)
            .arg(dlq_id)
            .query_async(&mut conn)
            .await?;

        Ok(reply.ids.into_iter().next().map(RawEntry::from))
    }

    /// Move one entry back to the source stream. `false` when the id is unknown.
    pub async fn reprocess_message(&self, dlq_id: &str) -> Result<bool, StreamError> {
        let Some(entry) = self.fetch(dlq_id).await? else {
            return Ok(false);
        };

        self.requeue(&entry).await?;
        Ok(true)
    }

    /// Move up to `count` of the oldest entries back to the source stream
    pub async fn reprocess_batch(&self, count: usize) -> Result<ReprocessResult, StreamError> {
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut result = ReprocessResult {
            requested: count,
            ..Default::default()
        };

        for entry in reply.ids.into_iter().map(RawEntry::from) {
            match self.requeue(&entry).await {
                Ok(new_id) => {
                    result.reprocessed += 1;
                    result.message_ids.push(new_id);
                }
                Err(e) => {
                    warn!(dlq_id = %entry.id, error = %e, "Failed to reprocess DLQ entry");
                    result.failed += 1;
                }
            }
        }

        info!(
            reprocessed = result.reprocessed,
            failed = result.failed,
            "Reprocessed DLQ batch"
        );
        Ok(result)
    }

    async fn requeue(&self, entry: &RawEntry) -> Result<String, StreamError> {
        let (message, _) = QueueMessage::from_fields(&entry.fields, &MessageKey::dlq_keys())?;
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.source_stream).arg("*");
        for (key, value) in message.to_fields(Some(1)) {
            cmd.arg(key).arg(value);
        }
        let new_id: String = cmd.query_async(&mut conn).await?;

        let _: i64 = redis::cmd("XDEL")
            .arg(&self.dlq_stream)
            .arg(&entry.id)
            .query_async(&mut conn)
            .await?;

        debug!(dlq_id = %entry.id, new_id = %new_id, "Requeued DLQ entry");
        Ok(new_id)
    }

    /// Delete one entry. `false` when the id is unknown.
    pub async fn archive_message(&self, dlq_id: &str) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();

        let deleted: i64 = redis::cmd("XDEL")
            .arg(&self.dlq_stream)
            .arg(dlq_id)
            .query_async(&mut conn)
            .await?;

        debug!(dlq_id = %dlq_id, deleted, "Archived DLQ entry");
        Ok(deleted > 0)
    }

    /// Delete every entry, returning how many there were
    pub async fn archive_all(&self) -> Result<i64, StreamError> {
        let mut conn = self.redis.clone();

        let length: i64 = redis::cmd("XLEN")
            .arg(&self.dlq_stream)
            .query_async(&mut conn)
            .await?;

        if length > 0 {
            let _: i64 = redis::cmd("XTRIM")
                .arg(&self.dlq_stream)
                .arg("MAXLEN")
                .arg(0)
                .query_async(&mut conn)
                .await?;

            info!(count = length, "Archived all DLQ entries");
        }

        Ok(length)
    }
}

/// A dead-lettered message as shown by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct DlqMessage {
    pub id: String,
    pub body: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub receive_count: Option<String>,
    pub error: Option<String>,
    pub error_category: Option<String>,
    pub source_id: Option<String>,
    pub failed_at: Option<String>,
}

impl From<RawEntry> for DlqMessage {
    fn from(entry: RawEntry) -> Self {
        let mut fields = entry.fields;
        let mut take = |key: MessageKey| fields.remove(key.as_ref());

        let body = take(MessageKey::Body);
        let receive_count = take(MessageKey::ReceiveCount);
        let error = take(MessageKey::Error);
        let error_category = take(MessageKey::ErrorCategory);
        let source_id = take(MessageKey::SourceId);
        let failed_at = take(MessageKey::FailedAt);

        Self {
            id: entry.id,
            body,
            attributes: fields,
            receive_count,
            error,
            error_category,
            source_id,
            failed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub stream_name: String,
    pub source_stream: String,
    pub length: i64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprocessResult {
    pub requested: usize,
    pub reprocessed: usize,
    pub failed: usize,
    /// New ids in the source stream
    pub message_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_message_splits_metadata() {
        let fields: BTreeMap<String, String> = [
            ("body", "spotify:track:abc"),
            ("channelId", "42"),
            ("receiveCount", "3"),
            ("error", "Processing error: device list failed"),
            ("errorCategory", "transient"),
            ("sourceId", "1700000000000-0"),
            ("failedAt", "2024-01-01T00:00:00+00:00"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let message = DlqMessage::from(RawEntry {
            id: "1700000000001-0".to_string(),
            fields,
        });

        assert_eq!(message.body.as_deref(), Some("spotify:track:abc"));
        assert_eq!(message.receive_count.as_deref(), Some("3"));
        assert_eq!(message.error_category.as_deref(), Some("transient"));
        assert_eq!(message.source_id.as_deref(), Some("1700000000000-0"));
        assert_eq!(message.attributes.len(), 1);
        assert_eq!(message.attributes.get("channelId").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_dlq_message_serializes() {
        let message = DlqMessage::from(RawEntry {
            id: "1-0".to_string(),
            fields: BTreeMap::new(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], "1-0");
        assert!(json["body"].is_null());
    }
}
