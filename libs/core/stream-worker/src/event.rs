//! Queue message and stream event types
//!
//! A stream entry is a flat field map. One field carries the message body,
//! one carries the receive count, and every other field is a string
//! attribute of the message.

use crate::error::StreamError;
use crate::registry::{MessageKey, StreamJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Body plus string attributes, the unit producers publish and consumers receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueMessage {
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

impl QueueMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Entry fields for XADD. `receive_count` is only written when known.
    pub fn to_fields(&self, receive_count: Option<u32>) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(self.attributes.len() + 2);
        fields.push((MessageKey::Body.to_string(), self.body.clone()));
        if let Some(count) = receive_count {
            fields.push((MessageKey::ReceiveCount.to_string(), count.to_string()));
        }
        for (key, value) in &self.attributes {
            fields.push((key.clone(), value.clone()));
        }
        fields
    }

    /// Rebuild a message from entry fields, returning it with its receive count.
    ///
    /// A missing receive count means first delivery. Keys in `skip` are
    /// dropped instead of becoming attributes.
    pub fn from_fields(
        fields: &BTreeMap<String, String>,
        skip: &[String],
    ) -> Result<(Self, u32), StreamError> {
        let body_key = MessageKey::Body.to_string();
        let count_key = MessageKey::ReceiveCount.to_string();

        let body = fields
            .get(&body_key)
            .ok_or_else(|| StreamError::Decode(format!("missing '{}' field", body_key)))?
            .clone();

        let receive_count = match fields.get(&count_key) {
            Some(raw) => raw.parse::<u32>().map_err(|e| {
                StreamError::Decode(format!("invalid '{}' value {:?}: {}", count_key, raw, e))
            })?,
            None => 1,
        };

        let attributes = fields
            .iter()
            .filter(|(k, _)| **k != body_key && **k != count_key && !skip.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok((Self { body, attributes }, receive_count.max(1)))
    }
}

/// Flatten a redis field map into strings, dropping values that are not text
pub fn fields_from_map(map: &HashMap<String, redis::Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| value_as_string(v).map(|s| (k.clone(), s)))
        .collect()
}

pub(crate) fn value_as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// A decoded job together with its stream metadata
#[derive(Debug, Clone)]
pub struct StreamEvent<J: StreamJob> {
    /// Redis stream entry ID (e.g. "1234567890123-0")
    pub stream_id: String,
    pub job: J,
    pub message: QueueMessage,
    /// When the entry was added, from the stream ID
    pub timestamp: DateTime<Utc>,
    /// Deliveries so far, including this one
    pub delivery_count: u32,
}

impl<J: StreamJob> StreamEvent<J> {
    /// Decode an entry into an event
    pub fn decode(stream_id: String, fields: &BTreeMap<String, String>) -> Result<Self, StreamError> {
        let (message, delivery_count) = QueueMessage::from_fields(fields, &[])?;
        let job = J::from_message(&message)?;
        let timestamp = parse_timestamp(&stream_id);

        Ok(Self {
            stream_id,
            job,
            message,
            timestamp,
            delivery_count,
        })
    }

    pub fn job_id(&self) -> String {
        self.job.job_id()
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }
}

/// Stream IDs are "timestamp_ms-sequence"
fn parse_timestamp(stream_id: &str) -> DateTime<Utc> {
    stream_id
        .split('-')
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Echo(String);

    impl StreamJob for Echo {
        fn job_id(&self) -> String {
            self.0.clone()
        }

        fn to_message(&self) -> QueueMessage {
            QueueMessage::new(&self.0)
        }

        fn from_message(message: &QueueMessage) -> Result<Self, StreamError> {
            Ok(Echo(message.body.clone()))
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_to_fields_layout() {
        let message = QueueMessage::new("spotify:track:abc").with_attribute("channelId", "42");

        assert_eq!(
            message.to_fields(None),
            vec![
                ("body".to_string(), "spotify:track:abc".to_string()),
                ("channelId".to_string(), "42".to_string()),
            ]
        );
        assert!(message.to_fields(Some(2)).contains(&("receiveCount".to_string(), "2".to_string())));
    }

    #[test]
    fn test_from_fields_defaults_receive_count() {
        let (message, count) =
            QueueMessage::from_fields(&fields(&[("body", "b"), ("channelId", "42")]), &[]).unwrap();

        assert_eq!(count, 1);
        assert_eq!(message.body, "b");
        assert_eq!(message.attribute("channelId"), Some("42"));
        assert!(message.attribute("receiveCount").is_none());
    }

    #[test]
    fn test_from_fields_skips_keys() {
        let (message, count) = QueueMessage::from_fields(
            &fields(&[("body", "b"), ("receiveCount", "3"), ("error", "boom")]),
            &["error".to_string()],
        )
        .unwrap();

        assert_eq!(count, 3);
        assert!(message.attributes.is_empty());
    }

    #[test]
    fn test_from_fields_rejects_missing_body() {
        let err = QueueMessage::from_fields(&fields(&[("channelId", "42")]), &[]).unwrap_err();
        assert!(matches!(err, StreamError::Decode(_)));
    }

    #[test]
    fn test_from_fields_rejects_bad_count() {
        let err =
            QueueMessage::from_fields(&fields(&[("body", "b"), ("receiveCount", "many")]), &[])
                .unwrap_err();
        assert!(err.to_string().contains("receiveCount"));
    }

    #[test]
    fn test_decode_event() {
        let event: StreamEvent<Echo> = StreamEvent::decode(
            "1700000000000-0".to_string(),
            &fields(&[("body", "hello"), ("receiveCount", "2")]),
        )
        .unwrap();

        assert_eq!(event.job_id(), "hello");
        assert!(event.is_redelivery());
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_fields_from_map_keeps_text_values() {
        let mut map = HashMap::new();
        map.insert("body".to_string(), redis::Value::BulkString(b"x".to_vec()));
        map.insert("receiveCount".to_string(), redis::Value::Int(2));
        map.insert("junk".to_string(), redis::Value::Nil);

        let flat = fields_from_map(&map);
        assert_eq!(flat.get("body").map(String::as_str), Some("x"));
        assert_eq!(flat.get("receiveCount").map(String::as_str), Some("2"));
        assert!(!flat.contains_key("junk"));
    }
}
