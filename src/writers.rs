//! Write paths into each side of the sync.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::platform::OntologyPlatform;
use crate::service::{PlaylistSnapshot, StreamingService};

/// Mutations on the streaming service.
#[derive(Clone)]
pub struct SpotifyWriter {
    service: Arc<dyn StreamingService>,
}

impl SpotifyWriter {
    pub fn new(service: Arc<dyn StreamingService>) -> Self {
        Self { service }
    }

    pub async fn create_playlist(
        &self,
        owner: &str,
        name: &str,
        description: &str,
    ) -> Result<PlaylistSnapshot> {
        let created = self.service.create_playlist(owner, name, description).await?;
        info!(playlist_id = %created.id, name = %name, "Created Spotify playlist");
        Ok(created)
    }

    pub async fn modify_playlist(&self, playlist_id: &str, name: &str, description: &str) -> Result<()> {
        self.service
            .modify_playlist(playlist_id, name, description)
            .await?;
        info!(playlist_id = %playlist_id, "Updated Spotify playlist details");
        Ok(())
    }

    pub async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        if uris.is_empty() {
            return Ok(());
        }
        self.service.add_tracks(playlist_id, uris).await?;
        info!(playlist_id = %playlist_id, count = uris.len(), "Added tracks");
        Ok(())
    }

    pub async fn remove_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        if uris.is_empty() {
            return Ok(());
        }
        self.service.remove_tracks(playlist_id, uris).await?;
        info!(playlist_id = %playlist_id, count = uris.len(), "Removed tracks");
        Ok(())
    }
}

/// Action names the platform exposes for playlist objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformActions {
    pub create_playlist: String,
    pub modify_playlist: String,
    pub delete_playlist: String,
}

impl Default for PlatformActions {
    fn default() -> Self {
        Self {
            create_playlist: "create-new-spotify-playlist".to_string(),
            modify_playlist: "modify-spotify-playlist".to_string(),
            delete_playlist: "delete-spotify-playlist".to_string(),
        }
    }
}

/// Mutations on the platform, expressed as named actions.
#[derive(Clone)]
pub struct PlatformWriter {
    platform: Arc<dyn OntologyPlatform>,
    actions: PlatformActions,
}

impl PlatformWriter {
    pub fn new(platform: Arc<dyn OntologyPlatform>, actions: PlatformActions) -> Self {
        Self { platform, actions }
    }

    pub async fn create_playlist(&self, playlist: &PlaylistSnapshot) -> Result<Value> {
        self.platform
            .apply_action(&self.actions.create_playlist, create_params(playlist))
            .await
    }

    /// `object_key` is the primary key of the existing platform object.
    pub async fn modify_playlist(&self, object_key: &str, playlist: &PlaylistSnapshot) -> Result<Value> {
        self.platform
            .apply_action(
                &self.actions.modify_playlist,
                modify_params(object_key, playlist),
            )
            .await
    }

    pub async fn delete_playlist(&self, playlist_id: &str) -> Result<Value> {
        self.platform
            .apply_action(
                &self.actions.delete_playlist,
                json!({ "spotify_playlist": playlist_id }),
            )
            .await
    }
}

fn create_params(playlist: &PlaylistSnapshot) -> Value {
    json!({
        "playlist_id": playlist.id,
        "name": playlist.name,
        "description": playlist.description,
        "owner": playlist.owner_id,
        "tracks_count": playlist.track_count,
    })
}

// The modify action takes the count as a string.
fn modify_params(object_key: &str, playlist: &PlaylistSnapshot) -> Value {
    json!({
        "spotify_playlist": object_key,
        "name": playlist.name,
        "description": playlist.description,
        "owner": playlist.owner_id,
        "tracks_count": playlist.track_count.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{playlist, FakePlatform, FakeSpotify};

    #[tokio::test]
    async fn test_platform_action_parameters() {
        let platform = Arc::new(FakePlatform::default());
        let writer = PlatformWriter::new(platform.clone(), PlatformActions::default());
        let p = playlist("P1", "Mix", 7);

        writer.create_playlist(&p).await.unwrap();
        writer.modify_playlist("P1", &p).await.unwrap();
        writer.delete_playlist("P1").await.unwrap();

        let actions = platform.actions();
        assert_eq!(actions[0].0, "create-new-spotify-playlist");
        assert_eq!(actions[0].1["tracks_count"], 7);
        assert_eq!(actions[0].1["owner"], "owner");
        assert_eq!(actions[1].0, "modify-spotify-playlist");
        assert_eq!(actions[1].1["tracks_count"], "7");
        assert_eq!(actions[1].1["spotify_playlist"], "P1");
        assert_eq!(actions[2].1, json!({ "spotify_playlist": "P1" }));
    }

    #[tokio::test]
    async fn test_empty_track_lists_skip_the_service() {
        let spotify = Arc::new(FakeSpotify::default());
        let writer = SpotifyWriter::new(spotify.clone());

        writer.add_tracks("P1", &[]).await.unwrap();
        writer.remove_tracks("P1", &[]).await.unwrap();

        assert_eq!(spotify.call_count("add_tracks"), 0);
        assert_eq!(spotify.call_count("remove_tracks"), 0);
    }
}
