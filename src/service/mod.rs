pub mod spotify;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Last-known state of one playlist on the streaming service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub track_count: u32,
    pub owner_id: String,
    pub owner_display_name: String,
    pub snapshot_id: String,
}

impl PlaylistSnapshot {
    /// Whether the fields the poller watches differ from `other`.
    pub fn differs_from(&self, other: &PlaylistSnapshot) -> bool {
        self.name != other.name
            || self.description != other.description
            || self.track_count != other.track_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistRef {
    pub name: String,
}

/// The item currently loaded in the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayingItem {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub popularity: Option<u32>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

/// Response of the currently-playing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentlyPlaying {
    pub is_playing: bool,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    /// "track", "episode", "ad" or "unknown"
    pub currently_playing_type: String,
    #[serde(default)]
    pub item: Option<PlayingItem>,
}

impl CurrentlyPlaying {
    /// Id of the playing item when it is a track.
    pub fn track_id(&self) -> Option<&str> {
        if self.currently_playing_type != "track" {
            return None;
        }
        self.item.as_ref().and_then(|item| item.id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub id: String,
    pub danceability: f64,
    pub energy: f64,
    pub key: i32,
    pub loudness: f64,
    pub mode: i32,
    pub speechiness: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    pub liveness: f64,
    pub valence: f64,
    pub tempo: f64,
    pub duration_ms: u64,
    pub time_signature: i32,
}

/// Everything emitted when the playing track changes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInformation {
    pub id: String,
    pub currently_playing: CurrentlyPlaying,
    /// Audio analysis is large and only forwarded, so it stays untyped.
    pub analysis: Value,
    pub features: AudioFeatures,
}

/// Operations the sync engine needs from the streaming service.
///
/// Every call authenticates with the current bearer credential. Failures are
/// retried by the next timer tick, never immediately.
#[async_trait]
pub trait StreamingService: Send + Sync {
    /// `None` when nothing is playing.
    async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>>;

    /// All playlists of the current user, following pagination to the end.
    async fn user_playlists(&self) -> Result<Vec<PlaylistSnapshot>>;

    async fn playlist_details(&self, playlist_id: &str) -> Result<PlaylistSnapshot>;

    /// URIs of every track currently in the playlist.
    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<String>>;

    async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()>;

    async fn remove_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()>;

    async fn modify_playlist(&self, playlist_id: &str, name: &str, description: &str)
        -> Result<()>;

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        description: &str,
    ) -> Result<PlaylistSnapshot>;

    async fn audio_features(&self, track_id: &str) -> Result<AudioFeatures>;

    async fn audio_analysis(&self, track_id: &str) -> Result<Value>;
}

pub use spotify::{SpotifyAccounts, SpotifyClient};
