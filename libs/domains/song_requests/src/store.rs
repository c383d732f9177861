//! Connection record store.
//!
//! Records live in a Redis hash per channel:
//!
//! ```text
//! song_requests:connection:{channelId}
//!     connectionStatus = "active"
//!     sess             = {"accessKeys":{"spotifyToken":{...},"twitchToken":{...}}}
//!     prefs            = {"explicitSongs":false,"maxSongLengthMs":0}
//! ```
//!
//! plus an index set `song_requests:connections` of every known channel id
//! and a counter hash `song_requests:deliveries:{channelId}`. The `sess`
//! field is written by the authorization flow; this crate only rewrites the
//! media player token inside it and keeps every other field as stored.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::error::{SongRequestError, SongRequestResult};
use crate::models::{
    ChannelConnection, ConnectionStatus, DeliveryCounts, DeliveryTally, Preference, Session,
    TokenPair, TokenRefresh,
};

const STATUS_FIELD: &str = "connectionStatus";
const SESSION_FIELD: &str = "sess";
const PREFERENCES_FIELD: &str = "prefs";

/// -1 missing record, 0 left inactive, 1 marked active
const MARK_ACTIVE_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if not current then return -1 end
if current == ARGV[2] then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
return 1
";

/// Durable per-channel record access.
///
/// Callers fetch a fresh record per operation and never cache it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, channel_id: &str) -> SongRequestResult<Option<ChannelConnection>>;

    /// Create or replace a record
    async fn put(&self, connection: &ChannelConnection) -> SongRequestResult<()>;

    async fn update_status(
        &self,
        channel_id: &str,
        status: ConnectionStatus,
    ) -> SongRequestResult<()>;

    /// Write a refreshed player token into the session blob, returning the stored pair
    async fn update_player_token(
        &self,
        channel_id: &str,
        refresh: &TokenRefresh,
    ) -> SongRequestResult<TokenPair>;

    /// Move to `active` unless the record is `inactive`, in one step.
    ///
    /// Returns whether the status was written; a disconnect that lands first wins.
    async fn mark_active(&self, channel_id: &str) -> SongRequestResult<bool>;

    /// Channel ids whose record currently has `status`
    async fn list_by_status(&self, status: ConnectionStatus) -> SongRequestResult<Vec<String>>;

    async fn set_preferences(
        &self,
        channel_id: &str,
        preferences: &Preference,
    ) -> SongRequestResult<()>;

    async fn record_delivery(&self, channel_id: &str, tally: DeliveryTally) -> SongRequestResult<()>;

    async fn delivery_counts(&self, channel_id: &str) -> SongRequestResult<DeliveryCounts>;
}

#[derive(Clone)]
pub struct RedisConnectionStore {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisConnectionStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "song_requests")
    }

    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn record_key(&self, channel_id: &str) -> String {
        format!("{}:connection:{}", self.prefix, channel_id)
    }

    fn index_key(&self) -> String {
        format!("{}:connections", self.prefix)
    }

    fn counter_key(&self, channel_id: &str) -> String {
        format!("{}:deliveries:{}", self.prefix, channel_id)
    }

    async fn ensure_exists(&self, key: &str, channel_id: &str) -> SongRequestResult<()> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(key).await?;
        if !exists {
            return Err(SongRequestError::ConnectionNotFound(channel_id.to_string()));
        }
        Ok(())
    }

    fn parse_record(
        channel_id: &str,
        mut fields: HashMap<String, String>,
    ) -> SongRequestResult<ChannelConnection> {
        let status = fields.remove(STATUS_FIELD).ok_or_else(|| {
            SongRequestError::Session(format!("record for {} has no {}", channel_id, STATUS_FIELD))
        })?;
        let connection_status = status.parse::<ConnectionStatus>().map_err(|_| {
            SongRequestError::Session(format!("unknown connection status {:?}", status))
        })?;

        let session = match fields.remove(SESSION_FIELD) {
            Some(raw) if !raw.is_empty() => serde_json::from_str::<Session>(&raw)?,
            _ => Session::default(),
        };

        let preferences = match fields.remove(PREFERENCES_FIELD) {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str::<Preference>(&raw)?),
            _ => None,
        };

        Ok(ChannelConnection {
            channel_id: channel_id.to_string(),
            connection_status,
            session,
            preferences,
        })
    }

    fn parse_counts(fields: HashMap<String, u64>) -> DeliveryCounts {
        let count = |tally: DeliveryTally| fields.get(tally.as_ref()).copied().unwrap_or_default();
        DeliveryCounts {
            delivered: count(DeliveryTally::Delivered),
            dropped: count(DeliveryTally::Dropped),
            failed: count(DeliveryTally::Failed),
        }
    }
}

#[async_trait]
impl ConnectionStore for RedisConnectionStore {
    #[instrument(skip(self))]
    async fn get(&self, channel_id: &str) -> SongRequestResult<Option<ChannelConnection>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.record_key(channel_id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        Self::parse_record(channel_id, fields).map(Some)
    }

    #[instrument(skip(self, connection), fields(channel_id = %connection.channel_id))]
    async fn put(&self, connection: &ChannelConnection) -> SongRequestResult<()> {
        let mut conn = self.redis.clone();
        let key = self.record_key(&connection.channel_id);
        let session = serde_json::to_string(&connection.session)?;

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    (STATUS_FIELD, connection.connection_status.to_string()),
                    (SESSION_FIELD, session),
                ],
            )
            .await?;
        match &connection.preferences {
            Some(preferences) => {
                let _: () = conn
                    .hset(&key, PREFERENCES_FIELD, serde_json::to_string(preferences)?)
                    .await?;
            }
            None => {
                let _: () = conn.hdel(&key, PREFERENCES_FIELD).await?;
            }
        }
        let _: () = conn.sadd(self.index_key(), &connection.channel_id).await?;

        debug!(status = %connection.connection_status, "Stored channel connection");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        channel_id: &str,
        status: ConnectionStatus,
    ) -> SongRequestResult<()> {
        let key = self.record_key(channel_id);
        self.ensure_exists(&key, channel_id).await?;

        let mut conn = self.redis.clone();
        let _: () = conn.hset(&key, STATUS_FIELD, status.to_string()).await?;
        debug!("Updated connection status");
        Ok(())
    }

    #[instrument(skip(self, refresh))]
    async fn update_player_token(
        &self,
        channel_id: &str,
        refresh: &TokenRefresh,
    ) -> SongRequestResult<TokenPair> {
        let mut connection = self
            .get(channel_id)
            .await?
            .ok_or_else(|| SongRequestError::ConnectionNotFound(channel_id.to_string()))?;

        let token = connection
            .session
            .access_keys
            .spotify_token
            .as_mut()
            .ok_or_else(|| SongRequestError::Session("no player token to refresh".to_string()))?;
        token.apply_refresh(refresh);
        let updated = token.clone();

        // only the session field changes, the status may have moved meanwhile
        let mut conn = self.redis.clone();
        let session = serde_json::to_string(&connection.session)?;
        let _: () = conn
            .hset(self.record_key(channel_id), SESSION_FIELD, session)
            .await?;

        debug!("Persisted refreshed player token");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn mark_active(&self, channel_id: &str) -> SongRequestResult<bool> {
        let mut conn = self.redis.clone();
        let result: i64 = Script::new(MARK_ACTIVE_SCRIPT)
            .key(self.record_key(channel_id))
            .arg(STATUS_FIELD)
            .arg(ConnectionStatus::Inactive.as_ref())
            .arg(ConnectionStatus::Active.as_ref())
            .invoke_async(&mut conn)
            .await?;

        match result {
            -1 => Err(SongRequestError::ConnectionNotFound(channel_id.to_string())),
            0 => Ok(false),
            _ => {
                debug!("Marked channel active");
                Ok(true)
            }
        }
    }

    async fn list_by_status(&self, status: ConnectionStatus) -> SongRequestResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut channel_ids: Vec<String> = conn.smembers(self.index_key()).await?;
        channel_ids.sort();

        let mut matching = Vec::new();
        for channel_id in channel_ids {
            let stored: Option<String> = conn.hget(self.record_key(&channel_id), STATUS_FIELD).await?;
            if stored.as_deref() == Some(status.as_ref()) {
                matching.push(channel_id);
            }
        }
        Ok(matching)
    }

    #[instrument(skip(self, preferences))]
    async fn set_preferences(
        &self,
        channel_id: &str,
        preferences: &Preference,
    ) -> SongRequestResult<()> {
        let key = self.record_key(channel_id);
        self.ensure_exists(&key, channel_id).await?;

        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(&key, PREFERENCES_FIELD, serde_json::to_string(preferences)?)
            .await?;
        debug!("Stored channel preferences");
        Ok(())
    }

    async fn record_delivery(&self, channel_id: &str, tally: DeliveryTally) -> SongRequestResult<()> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hincr(self.counter_key(channel_id), tally.as_ref(), 1)
            .await?;
        Ok(())
    }

    async fn delivery_counts(&self, channel_id: &str) -> SongRequestResult<DeliveryCounts> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, u64> = conn.hgetall(self.counter_key(channel_id)).await?;
        Ok(Self::parse_counts(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_record() {
        let record = RedisConnectionStore::parse_record(
            "42",
            fields(&[
                ("connectionStatus", "active"),
                (
                    "sess",
                    r#"{"accessKeys":{"spotifyToken":{"access_token":"a","refresh_token":"r","token_type":"Bearer"}}}"#,
                ),
            ]),
        )
        .unwrap();

        assert_eq!(record.channel_id, "42");
        assert!(record.is_active());
        assert_eq!(record.player_token().unwrap().access_token, "a");
        assert_eq!(record.streaming_token(), None);
    }

    #[test]
    fn test_parse_record_keeps_session_extras_and_preferences() {
        let record = RedisConnectionStore::parse_record(
            "42",
            fields(&[
                ("connectionStatus", "active"),
                ("sess", r#"{"cookie":{"path":"/"},"accessKeys":{}}"#),
                ("prefs", r#"{"explicitSongs":true,"maxSongLengthMs":600000}"#),
            ]),
        )
        .unwrap();

        assert_eq!(record.session.extra["cookie"]["path"], "/");
        let preferences = record.preferences.unwrap();
        assert!(preferences.explicit_songs);
        assert_eq!(preferences.max_song_length_ms, 600_000);
    }

    #[test]
    fn test_parse_counts_defaults_missing_fields() {
        let counts = RedisConnectionStore::parse_counts(HashMap::from([
            ("delivered".to_string(), 3),
            ("failed".to_string(), 1),
        ]));
        assert_eq!(
            counts,
            DeliveryCounts {
                delivered: 3,
                dropped: 0,
                failed: 1
            }
        );
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_parse_record_without_session() {
        let record =
            RedisConnectionStore::parse_record("42", fields(&[("connectionStatus", "starting")]))
                .unwrap();
        assert_eq!(record.connection_status, ConnectionStatus::Starting);
        assert!(record.player_token().is_none());
    }

    #[test]
    fn test_parse_record_rejects_unknown_status() {
        let err = RedisConnectionStore::parse_record("42", fields(&[("connectionStatus", "paused")]))
            .unwrap_err();
        assert!(matches!(err, SongRequestError::Session(_)));
    }

    #[test]
    fn test_parse_record_rejects_bad_session() {
        let err = RedisConnectionStore::parse_record(
            "42",
            fields(&[("connectionStatus", "active"), ("sess", "{not json")]),
        )
        .unwrap_err();
        assert!(matches!(err, SongRequestError::Session(_)));
    }
}
