//! Media player API.
//!
//! `PlayerApi` is the seam the delivery processor talks to; `SpotifyClient`
//! is the HTTP implementation.

mod spotify;

pub use spotify::SpotifyClient;

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default, env_required};

use crate::error::PlayerError;
use crate::models::{Device, TokenRefresh, Track};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlayerApi: Send + Sync {
    /// Playback surfaces visible to the token's owner, in the order the API lists them
    async fn list_devices(&self, access_token: &str) -> Result<Vec<Device>, PlayerError>;

    /// Add a track to the playback queue of `device_id`
    async fn enqueue(
        &self,
        access_token: &str,
        device_id: &str,
        track_uri: &str,
    ) -> Result<(), PlayerError>;

    /// Catalog entry for a bare track id (no `spotify:track:` prefix)
    async fn track(&self, access_token: &str, track_id: &str) -> Result<Track, PlayerError>;

    /// Exchange a refresh token for a new access token
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRefresh, PlayerError>;
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Web API base, e.g. `https://api.spotify.com/v1`
    pub api_url: String,
    /// Accounts service base, e.g. `https://accounts.spotify.com`
    pub accounts_url: String,
}

impl PlayerConfig {
    pub const DEFAULT_API_URL: &'static str = "https://api.spotify.com/v1";
    pub const DEFAULT_ACCOUNTS_URL: &'static str = "https://accounts.spotify.com";

    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_url: Self::DEFAULT_API_URL.to_string(),
            accounts_url: Self::DEFAULT_ACCOUNTS_URL.to_string(),
        }
    }

    /// Point both endpoints at one base URL (mock servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.api_url = base_url.clone();
        self.accounts_url = base_url;
        self
    }
}

impl FromEnv for PlayerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: env_required("SPOTIFY_CLIENT_ID")?,
            client_secret: env_required("SPOTIFY_CLIENT_SECRET")?,
            api_url: env_or_default("SPOTIFY_API_URL", Self::DEFAULT_API_URL),
            accounts_url: env_or_default("SPOTIFY_ACCOUNTS_URL", Self::DEFAULT_ACCOUNTS_URL),
        })
    }
}
