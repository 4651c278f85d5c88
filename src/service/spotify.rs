use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{AudioFeatures, CurrentlyPlaying, PlaylistSnapshot, StreamingService};
use crate::credentials::{CredentialCache, TokenEndpoint, TokenGrant};
use crate::error::{Result, SyncError};

pub const DEFAULT_API_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com";

/// Maximum number of URIs accepted by one add/remove call.
const TRACK_BATCH_LIMIT: usize = 100;
const PAGE_LIMIT: u32 = 50;

// API Response models
#[derive(Debug, Deserialize)]
struct Paging<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    id: String,
    name: String,
    description: Option<String>,
    #[serde(default)]
    snapshot_id: String,
    tracks: TracksRef,
    owner: OwnerItem,
}

#[derive(Debug, Deserialize)]
struct TracksRef {
    total: u32,
}

#[derive(Debug, Deserialize)]
struct OwnerItem {
    id: String,
    display_name: Option<String>,
}

impl From<PlaylistItem> for PlaylistSnapshot {
    fn from(item: PlaylistItem) -> Self {
        let owner_display_name = item
            .owner
            .display_name
            .unwrap_or_else(|| item.owner.id.clone());
        PlaylistSnapshot {
            id: item.id,
            name: item.name,
            description: item.description.unwrap_or_default(),
            track_count: item.tracks.total,
            owner_id: item.owner.id,
            owner_display_name,
            snapshot_id: item.snapshot_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistTrackItem {
    track: Option<TrackRef>,
}

#[derive(Debug, Deserialize)]
struct TrackRef {
    uri: Option<String>,
}

/// Client for the Spotify Web API.
pub struct SpotifyClient {
    http_client: HttpClient,
    api_url: String,
    credentials: Arc<CredentialCache>,
}

impl SpotifyClient {
    pub fn new(api_url: impl Into<String>, credentials: Arc<CredentialCache>) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(format!("playsync/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.credentials.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.send(self.http_client.get(url)).await?;
        response.json().await.map_err(|e| SyncError::decode("spotify response", e))
    }

    /// Collect every item of a paginated listing by following `next` links.
    async fn get_all_pages<T: DeserializeOwned>(&self, first_url: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let page: Paging<T> = self.get_json(&url).await?;
            debug!(url = %url, count = page.items.len(), "Fetched page");
            items.extend(page.items);
            next = page.next;
        }
        Ok(items)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Upstream {
        service: "spotify",
        status: status.as_u16(),
        message: body,
    })
}

#[async_trait]
impl StreamingService for SpotifyClient {
    async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>> {
        let url = self.url("/me/player/currently-playing");
        let response = self.send(self.http_client.get(&url)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| SyncError::decode("currently playing", e))
    }

    async fn user_playlists(&self) -> Result<Vec<PlaylistSnapshot>> {
        let first = self.url(&format!("/me/playlists?limit={PAGE_LIMIT}"));
        let items: Vec<PlaylistItem> = self.get_all_pages(first).await?;
        Ok(items.into_iter().map(PlaylistSnapshot::from).collect())
    }

    async fn playlist_details(&self, playlist_id: &str) -> Result<PlaylistSnapshot> {
        let url = self.url(&format!("/playlists/{playlist_id}"));
        match self.get_json::<PlaylistItem>(&url).await {
            Ok(item) => Ok(item.into()),
            Err(SyncError::Upstream { status: 404, .. }) => {
                Err(SyncError::NotFound(format!("playlist {playlist_id}")))
            }
            Err(e) => Err(e),
        }
    }

    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<String>> {
        let first = self.url(&format!(
            "/playlists/{playlist_id}/tracks?fields=items(track(uri)),next&limit=100"
        ));
        let items: Vec<PlaylistTrackItem> = self.get_all_pages(first).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| item.track.and_then(|t| t.uri))
            .collect())
    }

    async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        let url = self.url(&format!("/playlists/{playlist_id}/tracks"));
        for chunk in uris.chunks(TRACK_BATCH_LIMIT) {
            self.send(self.http_client.post(&url).json(&json!({ "uris": chunk })))
                .await?;
        }
        Ok(())
    }

    async fn remove_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        let url = self.url(&format!("/playlists/{playlist_id}/tracks"));
        for chunk in uris.chunks(TRACK_BATCH_LIMIT) {
            let tracks: Vec<Value> = chunk.iter().map(|uri| json!({ "uri": uri })).collect();
            self.send(self.http_client.delete(&url).json(&json!({ "tracks": tracks })))
                .await?;
        }
        Ok(())
    }

    async fn modify_playlist(
        &self,
        playlist_id: &str,
        name: &str,
        description: &str,
    ) -> Result<()> {
        let url = self.url(&format!("/playlists/{playlist_id}"));
        self.send(
            self.http_client
                .put(&url)
                .json(&json!({ "name": name, "description": description })),
        )
        .await?;
        Ok(())
    }

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        description: &str,
    ) -> Result<PlaylistSnapshot> {
        let url = self.url(&format!("/users/{user_id}/playlists"));
        let response = self
            .send(
                self.http_client
                    .post(&url)
                    .json(&json!({ "name": name, "description": description })),
            )
            .await?;
        let item: PlaylistItem = response
            .json()
            .await
            .map_err(|e| SyncError::decode("created playlist", e))?;
        Ok(item.into())
    }

    async fn audio_features(&self, track_id: &str) -> Result<AudioFeatures> {
        self.get_json(&self.url(&format!("/audio-features/{track_id}"))).await
    }

    async fn audio_analysis(&self, track_id: &str) -> Result<Value> {
        self.get_json(&self.url(&format!("/audio-analysis/{track_id}"))).await
    }
}

/// The accounts service token endpoint, authenticated with the app's
/// client credentials.
pub struct SpotifyAccounts {
    http_client: HttpClient,
    accounts_url: String,
    client_id: String,
    client_secret: String,
}

impl SpotifyAccounts {
    pub fn new(
        accounts_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http_client: HttpClient::new(),
            accounts_url: accounts_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", general_purpose::STANDARD.encode(raw))
    }
}

#[async_trait]
impl TokenEndpoint for SpotifyAccounts {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let url = format!("{}/api/token", self.accounts_url);
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.basic_auth())
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| SyncError::decode("token response", e))?;
        if grant.access_token.is_empty() {
            return Err(SyncError::Auth("no access token in response".to_string()));
        }
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let accounts = SpotifyAccounts::new(DEFAULT_ACCOUNTS_URL, "id", "secret");
        // base64("id:secret")
        assert_eq!(accounts.basic_auth(), "Basic aWQ6c2VjcmV0");
    }

    #[test]
    fn test_playlist_item_defaults_display_name_to_owner_id() {
        let json = r#"{
            "id": "p1",
            "name": "Mix",
            "description": null,
            "snapshot_id": "snap",
            "tracks": {"total": 3},
            "owner": {"id": "user1", "display_name": null}
        }"#;
        let item: PlaylistItem = serde_json::from_str(json).unwrap();
        let snapshot = PlaylistSnapshot::from(item);
        assert_eq!(snapshot.owner_display_name, "user1");
        assert_eq!(snapshot.description, "");
        assert_eq!(snapshot.track_count, 3);
    }
}
