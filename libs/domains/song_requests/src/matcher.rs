//! Song request qualification.
//!
//! A redemption qualifies when its reward is the channel's song request
//! reward and the viewer typed nothing but a single track URI. Without a
//! configured reward id, any reward whose title mentions "song request" counts.

use regex::Regex;
use std::sync::LazyLock;

/// Track URI at the start of the input; trailing text is caught by the token count
static TRACK_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^spotify:track:([A-Za-z0-9_]+)").unwrap());

pub fn is_song_request(reward_title: &str) -> bool {
    reward_title.to_lowercase().contains("song request")
}

/// A configured reward id takes precedence over the title match
pub fn is_song_request_reward(reward_id: &str, reward_title: &str, custom_reward_id: Option<&str>) -> bool {
    match custom_reward_id {
        Some(expected) => reward_id == expected,
        None => is_song_request(reward_title),
    }
}

pub fn is_track_uri(input: &str) -> bool {
    TRACK_URI.is_match(input)
}

/// Catalog id of a track URI, without any trailing query text
pub fn track_id(track_uri: &str) -> Option<&str> {
    TRACK_URI
        .captures(track_uri)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str())
}

/// Exactly one whitespace-separated token, and it is a track URI
pub fn qualifies(user_input: &str) -> bool {
    is_track_uri(user_input) && user_input.split(char::is_whitespace).count() == 1
}
