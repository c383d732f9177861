//! Spotify Web API client.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{PlayerApi, PlayerConfig};
use crate::error::PlayerError;
use crate::models::{Device, DeviceList, TokenRefresh, Track};

pub struct SpotifyClient {
    config: PlayerConfig,
    client: Client,
}

impl SpotifyClient {
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }
}

// Spotify error bodies

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    /// Web API: `{"error":{"status":404,"message":"..."}}`
    Api { error: ApiErrorDetail },
    /// Accounts service: `{"error":"invalid_grant","error_description":"..."}`
    OAuth {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: String,
}

/// Map non-success statuses onto [`PlayerError`]
async fn check(response: Response) -> Result<Response, PlayerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED => Err(PlayerError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Err(PlayerError::RateLimited),
        _ => {
            let text = response.text().await.unwrap_or_default();
            let (status, message) = match serde_json::from_str::<ErrorBody>(&text) {
                Ok(ErrorBody::Api { error }) => {
                    (error.status.unwrap_or(status.as_u16()), error.message)
                }
                Ok(ErrorBody::OAuth {
                    error,
                    error_description,
                }) => (
                    status.as_u16(),
                    error_description.map_or(error.clone(), |d| format!("{}: {}", error, d)),
                ),
                Err(_) => (status.as_u16(), text),
            };
            Err(PlayerError::Api { status, message })
        }
    }
}

#[async_trait]
impl PlayerApi for SpotifyClient {
    #[instrument(skip_all)]
    async fn list_devices(&self, access_token: &str) -> Result<Vec<Device>, PlayerError> {
        let response = self
            .client
            .get(format!("{}/me/player/devices", self.config.api_url))
            .bearer_auth(access_token)
            .send()
            .await?;

        let list: DeviceList = check(response).await?.json().await?;
        debug!(count = list.devices.len(), "Fetched devices");
        Ok(list.devices)
    }

    #[instrument(skip(self, access_token))]
    async fn enqueue(
        &self,
        access_token: &str,
        device_id: &str,
        track_uri: &str,
    ) -> Result<(), PlayerError> {
        let response = self
            .client
            .post(format!("{}/me/player/queue", self.config.api_url))
            .bearer_auth(access_token)
            .query(&[("uri", track_uri), ("device_id", device_id)])
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, access_token))]
    async fn track(&self, access_token: &str, track_id: &str) -> Result<Track, PlayerError> {
        let response = self
            .client
            .get(format!("{}/tracks/{}", self.config.api_url, track_id))
            .bearer_auth(access_token)
            .send()
            .await?;

        let track: Track = check(response).await?.json().await?;
        debug!(explicit = track.explicit, duration_ms = track.duration_ms, "Fetched track");
        Ok(track)
    }

    #[instrument(skip_all)]
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRefresh, PlayerError> {
        let response = self
            .client
            .post(format!("{}/api/token", self.config.accounts_url))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        let refreshed: TokenRefresh = check(response).await?.json().await?;
        debug!(
            rotated = refreshed.refresh_token.is_some(),
            expires_in = ?refreshed.expires_in,
            "Refreshed player token"
        );
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> SpotifyClient {
        SpotifyClient::new(PlayerConfig::new("client-id", "client-secret").with_base_url(server.url()))
    }

    #[tokio::test]
    async fn test_list_devices_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me/player/devices")
            .match_header("authorization", "Bearer access-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "devices": [
                        { "id": "phone", "is_active": false, "name": "Phone", "type": "Smartphone" },
                        { "id": "desk", "is_active": true, "name": "Desk", "type": "Computer" }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let devices = client_for(&server).list_devices("access-1").await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].id.as_deref(), Some("desk"));
        assert!(devices[1].is_active_computer());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_track_lookup() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tracks/5Cjkfft7iRWJp4elZXgjkc")
            .match_header("authorization", "Bearer access-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "id": "5Cjkfft7iRWJp4elZXgjkc",
                    "name": "Song",
                    "explicit": true,
                    "duration_ms": 215000,
                    "popularity": 40
                })
                .to_string(),
            )
            .create_async()
            .await;

        let track = client_for(&server)
            .track("access-1", "5Cjkfft7iRWJp4elZXgjkc")
            .await
            .unwrap();

        assert!(track.explicit);
        assert_eq!(track.duration_ms, 215_000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_devices_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/me/player/devices")
            .with_status(401)
            .with_body(r#"{"error":{"status":401,"message":"The access token expired"}}"#)
            .create_async()
            .await;

        let err = client_for(&server).list_devices("stale").await.unwrap_err();
        assert!(matches!(err, PlayerError::Unauthorized));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/me/player/devices")
            .with_status(429)
            .with_header("retry-after", "3")
            .create_async()
            .await;

        let err = client_for(&server).list_devices("t").await.unwrap_err();
        assert!(matches!(err, PlayerError::RateLimited));
    }

    #[tokio::test]
    async fn test_enqueue_passes_uri_and_device() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/me/player/queue")
            .match_header("authorization", "Bearer access-1")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uri".into(), "spotify:track:abc".into()),
                Matcher::UrlEncoded("device_id".into(), "desk".into()),
            ]))
            .with_status(204)
            .create_async()
            .await;

        client_for(&server)
            .enqueue("access-1", "desk", "spotify:track:abc")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_enqueue_error_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/me/player/queue")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"status":404,"message":"Player command failed: No active device found"}}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .enqueue("t", "desk", "spotify:track:abc")
            .await
            .unwrap_err();

        match err {
            PlayerError::Api { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("No active device"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_token_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
                Matcher::UrlEncoded("client_id".into(), "client-id".into()),
                Matcher::UrlEncoded("client_secret".into(), "client-secret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"access-2","token_type":"Bearer","scope":"user-modify-playback-state","expires_in":3600}"#,
            )
            .create_async()
            .await;

        let refreshed = client_for(&server).refresh_token("refresh-1").await.unwrap();

        assert_eq!(refreshed.access_token, "access-2");
        assert_eq!(refreshed.refresh_token, None);
        assert_eq!(refreshed.expires_in, Some(3600));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_token_oauth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#)
            .create_async()
            .await;

        let err = client_for(&server).refresh_token("revoked").await.unwrap_err();
        match err {
            PlayerError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "invalid_grant: Refresh token revoked");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
