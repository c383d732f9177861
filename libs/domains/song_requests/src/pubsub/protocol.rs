//! PubSub wire frames.
//!
//! Outbound: `{"type":"PING"}` and
//! `{"type":"LISTEN","nonce":..,"data":{"topics":[..],"auth_token":..}}`.
//! Inbound `MESSAGE` frames carry the redemption as a JSON-encoded string
//! in `data.message`, so it is decoded in two steps.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::matcher::{is_song_request_reward, qualifies};
use crate::models::DeliveryRequest;

/// Inner message type for channel point redemptions
pub const REWARD_REDEEMED: &str = "reward-redeemed";

/// Redemption topic for one channel
pub fn topic_for(channel_id: &str) -> String {
    format!("channel-points-channel-v1.{}", channel_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OutboundFrame {
    Ping,
    Listen { nonce: String, data: ListenData },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenData {
    pub topics: Vec<String>,
    pub auth_token: String,
}

impl OutboundFrame {
    pub fn listen(channel_id: &str, auth_token: &str) -> Self {
        OutboundFrame::Listen {
            nonce: uuid::Uuid::new_v4().to_string(),
            data: ListenData {
                topics: vec![topic_for(channel_id)],
                auth_token: auth_token.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> String {
        // plain strings and vecs, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum InboundFrame {
    Pong,
    Reconnect,
    Response {
        #[serde(default)]
        nonce: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Message {
        data: MessageData,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub topic: String,
    /// JSON-encoded [`RedemptionMessage`]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedemptionMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<RedemptionData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedemptionData {
    pub redemption: Redemption,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Redemption {
    pub reward: Reward,
    #[serde(default)]
    pub user_input: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reward {
    #[serde(default)]
    pub id: String,
    pub title: String,
}

/// What the client should do with one inbound text frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    Reconnect,
    Deliver(DeliveryRequest),
    Ignore,
}

/// Decode a frame and apply the song request filter.
///
/// `custom_reward_id` is the channel's configured song request reward, if any.
pub fn handle_frame(channel_id: &str, custom_reward_id: Option<&str>, text: &str) -> FrameAction {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(channel_id = %channel_id, error = %e, "Dropping malformed frame");
            return FrameAction::Ignore;
        }
    };

    match frame {
        InboundFrame::Reconnect => FrameAction::Reconnect,
        InboundFrame::Pong => {
            trace!(channel_id = %channel_id, "PONG");
            FrameAction::Ignore
        }
        InboundFrame::Response { nonce, error } => {
            match error.filter(|e| !e.is_empty()) {
                Some(error) => {
                    warn!(channel_id = %channel_id, nonce = ?nonce, error = %error, "LISTEN rejected")
                }
                None => debug!(channel_id = %channel_id, nonce = ?nonce, "LISTEN acknowledged"),
            }
            FrameAction::Ignore
        }
        InboundFrame::Message { data } => match song_request_from(channel_id, custom_reward_id, &data.message) {
            Some(request) => FrameAction::Deliver(request),
            None => FrameAction::Ignore,
        },
        InboundFrame::Unknown => {
            debug!(channel_id = %channel_id, "Ignoring unknown frame type");
            FrameAction::Ignore
        }
    }
}

fn song_request_from(
    channel_id: &str,
    custom_reward_id: Option<&str>,
    message: &str,
) -> Option<DeliveryRequest> {
    let message: RedemptionMessage = match serde_json::from_str(message) {
        Ok(message) => message,
        Err(e) => {
            warn!(channel_id = %channel_id, error = %e, "Dropping malformed redemption");
            return None;
        }
    };

    if message.kind != REWARD_REDEEMED {
        debug!(channel_id = %channel_id, kind = %message.kind, "Ignoring message type");
        return None;
    }

    let redemption = message.data?.redemption;
    let reward = &redemption.reward;
    if !is_song_request_reward(&reward.id, &reward.title, custom_reward_id) {
        return None;
    }

    let input = redemption.user_input.unwrap_or_default();
    if !qualifies(&input) {
        debug!(channel_id = %channel_id, input = %input, "Song request input is not a single track URI");
        return None;
    }

    Some(DeliveryRequest::new(channel_id, input))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A MESSAGE frame as PubSub sends it
    pub(crate) fn redemption_frame(kind: &str, title: &str, input: Option<&str>) -> String {
        let inner = json!({
            "type": kind,
            "data": {
                "timestamp": "2024-01-01T00:00:00Z",
                "redemption": {
                    "id": "r-1",
                    "user": { "id": "9", "login": "viewer" },
                    "reward": { "id": "w-1", "title": title, "cost": 500 },
                    "user_input": input,
                    "status": "UNFULFILLED"
                }
            }
        });
        json!({
            "type": "MESSAGE",
            "data": {
                "topic": "channel-points-channel-v1.42",
                "message": inner.to_string()
            }
        })
        .to_string()
    }

    #[test]
    fn test_outbound_frames() {
        assert_eq!(OutboundFrame::Ping.to_json(), r#"{"type":"PING"}"#);

        let listen: serde_json::Value =
            serde_json::from_str(&OutboundFrame::listen("42", "tw-access").to_json()).unwrap();
        assert_eq!(listen["type"], "LISTEN");
        assert_eq!(listen["data"]["topics"][0], "channel-points-channel-v1.42");
        assert_eq!(listen["data"]["auth_token"], "tw-access");
        assert_eq!(listen["nonce"].as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_listen_nonce_is_fresh() {
        assert_ne!(OutboundFrame::listen("42", "t"), OutboundFrame::listen("42", "t"));
    }

    #[test]
    fn test_qualifying_redemption_is_delivered() {
        let frame = redemption_frame(
            "reward-redeemed",
            "Song Request",
            Some("spotify:track:5Cjkfft7iRWJp4elZXgjkc"),
        );
        assert_eq!(
            handle_frame("42", None, &frame),
            FrameAction::Deliver(DeliveryRequest::new("42", "spotify:track:5Cjkfft7iRWJp4elZXgjkc"))
        );
    }

    #[test]
    fn test_other_message_types_are_ignored() {
        let frame = redemption_frame(
            "custom-reward-updated",
            "Song Request",
            Some("spotify:track:5Cjkfft7iRWJp4elZXgjkc"),
        );
        assert_eq!(handle_frame("42", None, &frame), FrameAction::Ignore);
    }

    #[test]
    fn test_non_song_rewards_are_ignored() {
        let frame = redemption_frame("reward-redeemed", "Hydrate", Some("spotify:track:abc"));
        assert_eq!(handle_frame("42", None, &frame), FrameAction::Ignore);
    }

    #[test]
    fn test_configured_reward_id_is_matched() {
        // the fixture's reward id is "w-1"
        let hydrate = redemption_frame("reward-redeemed", "Hydrate", Some("spotify:track:abc"));
        assert_eq!(
            handle_frame("42", Some("w-1"), &hydrate),
            FrameAction::Deliver(DeliveryRequest::new("42", "spotify:track:abc"))
        );

        let titled = redemption_frame("reward-redeemed", "Song Request", Some("spotify:track:abc"));
        assert_eq!(handle_frame("42", Some("w-other"), &titled), FrameAction::Ignore);
    }

    #[test]
    fn test_non_qualifying_input_is_ignored() {
        for input in [
            Some("please play spotify:track:5Cjkfft7iRWJp4elZXgjkc now"),
            Some("spotify:track:5Cjk fft7iRWJp"),
            None,
        ] {
            let frame = redemption_frame("reward-redeemed", "song request", input);
            assert_eq!(handle_frame("42", None, &frame), FrameAction::Ignore);
        }
    }

    #[test]
    fn test_reconnect_directive() {
        assert_eq!(handle_frame("42", None, r#"{"type":"RECONNECT"}"#), FrameAction::Reconnect);
    }

    #[test]
    fn test_control_frames_are_ignored() {
        assert_eq!(handle_frame("42", None, r#"{"type":"PONG"}"#), FrameAction::Ignore);
        assert_eq!(
            handle_frame("42", None, r#"{"type":"RESPONSE","nonce":"n","error":"ERR_BADAUTH"}"#),
            FrameAction::Ignore
        );
        assert_eq!(
            handle_frame("42", None, r#"{"type":"RESPONSE","nonce":"n","error":""}"#),
            FrameAction::Ignore
        );
        assert_eq!(handle_frame("42", None, r#"{"type":"WHATEVER"}"#), FrameAction::Ignore);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        assert_eq!(handle_frame("42", None, "not json"), FrameAction::Ignore);
        assert_eq!(
            handle_frame("42", None, r#"{"type":"MESSAGE","data":{"topic":"t","message":"{broken"}}"#),
            FrameAction::Ignore
        );
    }

    #[test]
    fn test_inbound_response_parses() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"RESPONSE","nonce":"abc","error":""}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                nonce: Some("abc".into()),
                error: Some(String::new())
            }
        );
    }
}
