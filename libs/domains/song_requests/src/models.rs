//! Data models for the song requests domain.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stream_worker::{QueueMessage, StreamError, StreamJob};
use strum::{AsRefStr, Display, EnumString};

use crate::error::TrackRejection;

/// Attribute carrying the channel id on queue messages
pub const CHANNEL_ID_ATTRIBUTE: &str = "channelId";

// ============================================================================
// Channel connection record
// ============================================================================

/// Lifecycle of a channel's subscription as seen by the streamer.
///
/// `Starting` is written when a connection attempt begins, `Active` once the
/// LISTEN request has been sent and `Inactive` only by an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Starting,
    Active,
    Inactive,
}

impl ConnectionStatus {
    /// Statuses the listener picks back up after a restart
    pub fn should_resume(&self) -> bool {
        matches!(self, ConnectionStatus::Starting | ConnectionStatus::Active)
    }
}

/// OAuth token pair as issued by either platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Fields the authorization flow stores alongside, e.g. `expires_in`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
            scope: None,
            extra: Map::new(),
        }
    }

    /// Take the new access token, and whatever else the refresh response rotated
    pub fn apply_refresh(&mut self, refresh: &TokenRefresh) {
        self.access_token = refresh.access_token.clone();
        if let Some(refresh_token) = &refresh.refresh_token {
            self.refresh_token = refresh_token.clone();
        }
        if let Some(token_type) = &refresh.token_type {
            self.token_type = token_type.clone();
        }
        if refresh.scope.is_some() {
            self.scope = refresh.scope.clone();
        }
        if let Some(expires_in) = refresh.expires_in {
            self.extra.insert("expires_in".to_string(), Value::from(expires_in));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeys {
    /// Media player credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_token: Option<TokenPair>,
    /// Streaming platform credentials, used for the PubSub LISTEN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitch_token: Option<TokenPair>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Session blob written by the authorization flow.
///
/// Only the access keys are interpreted; everything else the flow stores
/// (cookie settings and the like) is carried through untouched on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub access_keys: AccessKeys,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-channel delivery rules set by the broadcaster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    #[serde(default)]
    pub explicit_songs: bool,
    /// Longest accepted track; 0 means no limit
    #[serde(default)]
    pub max_song_length_ms: u64,
    /// When set, only redemptions of this reward count as song requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_reward_id: Option<String>,
}

impl Preference {
    pub fn check(&self, track: &Track) -> Result<(), TrackRejection> {
        if track.explicit && !self.explicit_songs {
            return Err(TrackRejection::Explicit);
        }
        if self.max_song_length_ms > 0 && track.duration_ms > self.max_song_length_ms {
            return Err(TrackRejection::TooLong {
                duration_ms: track.duration_ms,
                max_ms: self.max_song_length_ms,
            });
        }
        Ok(())
    }

    pub fn reward_id(&self) -> Option<&str> {
        self.custom_reward_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// One record per broadcaster channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConnection {
    pub channel_id: String,
    pub connection_status: ConnectionStatus,
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preference>,
}

impl ChannelConnection {
    pub fn new(channel_id: impl Into<String>, connection_status: ConnectionStatus) -> Self {
        Self {
            channel_id: channel_id.into(),
            connection_status,
            session: Session::default(),
            preferences: None,
        }
    }

    pub fn with_preferences(mut self, preferences: Preference) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn with_player_token(mut self, token: TokenPair) -> Self {
        self.session.access_keys.spotify_token = Some(token);
        self
    }

    pub fn with_streaming_token(mut self, token: TokenPair) -> Self {
        self.session.access_keys.twitch_token = Some(token);
        self
    }

    pub fn is_active(&self) -> bool {
        self.connection_status == ConnectionStatus::Active
    }

    pub fn player_token(&self) -> Option<&TokenPair> {
        self.session.access_keys.spotify_token.as_ref()
    }

    /// Access token for the PubSub LISTEN
    pub fn streaming_token(&self) -> Option<&str> {
        self.session
            .access_keys
            .twitch_token
            .as_ref()
            .map(|t| t.access_token.as_str())
    }
}

/// Token endpoint response for `grant_type=refresh_token`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenRefresh {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenRefresh {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: None,
            scope: None,
            expires_in: None,
        }
    }
}

// ============================================================================
// Delivery request (queue job)
// ============================================================================

/// A qualifying song request on its way to the player.
///
/// On the queue the body is the raw track URI and the channel id travels as
/// the `channelId` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub channel_id: String,
    pub track_uri: String,
}

impl DeliveryRequest {
    pub fn new(channel_id: impl Into<String>, track_uri: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            track_uri: track_uri.into(),
        }
    }
}

impl StreamJob for DeliveryRequest {
    fn job_id(&self) -> String {
        format!("{}:{}", self.channel_id, self.track_uri)
    }

    fn to_message(&self) -> QueueMessage {
        QueueMessage::new(&self.track_uri).with_attribute(CHANNEL_ID_ATTRIBUTE, &self.channel_id)
    }

    fn from_message(message: &QueueMessage) -> Result<Self, StreamError> {
        let channel_id = message
            .attribute(CHANNEL_ID_ATTRIBUTE)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                StreamError::Decode(format!("missing '{}' attribute", CHANNEL_ID_ATTRIBUTE))
            })?;

        Ok(Self::new(channel_id, &message.body))
    }
}

// ============================================================================
// Player API
// ============================================================================

/// A playback surface reported by the player. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Restricted devices report no id
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub is_active: bool,
}

impl Device {
    pub const COMPUTER: &'static str = "Computer";

    pub fn is_active_computer(&self) -> bool {
        self.device_type == Self::COMPUTER && self.is_active
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// The parts of a track lookup that preferences are checked against
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Track {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub explicit: bool,
    pub duration_ms: u64,
}

// ============================================================================
// Delivery counters
// ============================================================================

/// Terminal result of one request, counted per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryTally {
    Delivered,
    /// Inactive channel or no device; nothing to retry
    Dropped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryCounts {
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl DeliveryCounts {
    pub fn total(&self) -> u64 {
        self.delivered + self.dropped + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(ConnectionStatus::Active.to_string(), "active");
        assert_eq!("inactive".parse::<ConnectionStatus>().unwrap(), ConnectionStatus::Inactive);
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Starting).unwrap(),
            "\"starting\""
        );
        assert!(ConnectionStatus::Starting.should_resume());
        assert!(!ConnectionStatus::Inactive.should_resume());
    }

    #[test]
    fn test_session_blob_parses() {
        let raw = r#"{
            "accessKeys": {
                "spotifyToken": {
                    "access_token": "sp-access",
                    "refresh_token": "sp-refresh",
                    "token_type": "Bearer",
                    "scope": "user-modify-playback-state"
                },
                "twitchToken": {
                    "access_token": "tw-access",
                    "refresh_token": "tw-refresh",
                    "token_type": "bearer"
                }
            },
            "cookie": { "path": "/" }
        }"#;

        let session: Session = serde_json::from_str(raw).unwrap();
        let connection = ChannelConnection {
            channel_id: "42".into(),
            connection_status: ConnectionStatus::Active,
            session,
            preferences: None,
        };

        assert_eq!(connection.player_token().unwrap().access_token, "sp-access");
        assert_eq!(connection.streaming_token(), Some("tw-access"));
        assert_eq!(connection.player_token().unwrap().scope.as_deref(), Some("user-modify-playback-state"));
    }

    #[test]
    fn test_refresh_keeps_unrelated_session_fields() {
        let raw = r#"{
            "cookie": {"path": "/", "httpOnly": true},
            "accessKeys": {
                "spotifyToken": {
                    "access_token": "sp-old",
                    "refresh_token": "sp-refresh",
                    "token_type": "Bearer",
                    "expires_in": 3600
                },
                "twitchToken": {"access_token": "tw", "refresh_token": "tw-r"},
                "issuedBy": "auth-flow"
            }
        }"#;
        let mut session: Session = serde_json::from_str(raw).unwrap();

        let token = session.access_keys.spotify_token.as_mut().unwrap();
        token.apply_refresh(&TokenRefresh::new("sp-new"));

        let written: Value = serde_json::to_value(&session).unwrap();
        assert_eq!(written["cookie"], serde_json::json!({"path": "/", "httpOnly": true}));
        assert_eq!(written["accessKeys"]["issuedBy"], "auth-flow");
        assert_eq!(written["accessKeys"]["spotifyToken"]["access_token"], "sp-new");
        assert_eq!(written["accessKeys"]["spotifyToken"]["expires_in"], 3600);
        assert_eq!(written["accessKeys"]["twitchToken"]["access_token"], "tw");
    }

    #[test]
    fn test_refresh_updates_expiry_when_reported() {
        let mut pair = TokenPair::new("old", "r");
        pair.apply_refresh(&TokenRefresh {
            expires_in: Some(1800),
            ..TokenRefresh::new("new")
        });
        assert_eq!(pair.extra["expires_in"], 1800);
    }

    #[test]
    fn test_preference_rejects_explicit_unless_allowed() {
        let track = Track {
            id: "abc".into(),
            name: "Song".into(),
            explicit: true,
            duration_ms: 200_000,
        };

        assert_eq!(Preference::default().check(&track), Err(TrackRejection::Explicit));
        let allowing = Preference {
            explicit_songs: true,
            ..Preference::default()
        };
        assert_eq!(allowing.check(&track), Ok(()));
    }

    #[test]
    fn test_preference_max_length() {
        let track = Track {
            id: "abc".into(),
            name: String::new(),
            explicit: false,
            duration_ms: 400_000,
        };
        let limited = Preference {
            max_song_length_ms: 300_000,
            ..Preference::default()
        };

        assert_eq!(
            limited.check(&track),
            Err(TrackRejection::TooLong {
                duration_ms: 400_000,
                max_ms: 300_000
            })
        );
        // zero is no limit
        assert_eq!(Preference::default().check(&track), Ok(()));
    }

    #[test]
    fn test_preference_wire_format() {
        let preference: Preference =
            serde_json::from_str(r#"{"explicitSongs":true,"customRewardId":""}"#).unwrap();
        assert!(preference.explicit_songs);
        assert_eq!(preference.max_song_length_ms, 0);
        assert_eq!(preference.reward_id(), None);
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token_unless_rotated() {
        let mut pair = TokenPair::new("old", "refresh-1");

        pair.apply_refresh(&TokenRefresh::new("new"));
        assert_eq!(pair.access_token, "new");
        assert_eq!(pair.refresh_token, "refresh-1");

        let rotated = TokenRefresh {
            refresh_token: Some("refresh-2".into()),
            scope: Some("streaming".into()),
            ..TokenRefresh::new("newer")
        };
        pair.apply_refresh(&rotated);
        assert_eq!(pair.access_token, "newer");
        assert_eq!(pair.refresh_token, "refresh-2");
        assert_eq!(pair.scope.as_deref(), Some("streaming"));
        assert_eq!(pair.token_type, "Bearer");
    }

    #[test]
    fn test_delivery_request_message_shape() {
        let request = DeliveryRequest::new("42", "spotify:track:5Cjkfft7iRWJp4elZXgjkc");
        let message = request.to_message();

        assert_eq!(message.body, "spotify:track:5Cjkfft7iRWJp4elZXgjkc");
        assert_eq!(message.attribute("channelId"), Some("42"));
        assert_eq!(DeliveryRequest::from_message(&message).unwrap(), request);
    }

    #[test]
    fn test_delivery_request_requires_channel_id() {
        let message = QueueMessage::new("spotify:track:abc");
        assert!(matches!(
            DeliveryRequest::from_message(&message),
            Err(StreamError::Decode(_))
        ));

        let empty = QueueMessage::new("spotify:track:abc").with_attribute("channelId", "");
        assert!(DeliveryRequest::from_message(&empty).is_err());
    }

    #[test]
    fn test_device_list_parses() {
        let raw = r#"{"devices":[
            {"id":"abc","is_active":true,"name":"Desk","type":"Computer","volume_percent":50},
            {"id":null,"is_active":false,"name":"TV","type":"TV"}
        ]}"#;
        let list: DeviceList = serde_json::from_str(raw).unwrap();

        assert_eq!(list.devices.len(), 2);
        assert!(list.devices[0].is_active_computer());
        assert_eq!(list.devices[1].id, None);
    }
}
