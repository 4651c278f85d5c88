//! Cross-system playlist reconciliation.
//!
//! [`PlaylistReconciler`] applies platform playlist changes to the streaming
//! service, using the poller's snapshot cache to decide between create,
//! update and nothing. [`PlatformReconciler`] goes the other way and mirrors
//! the poller's playlist events onto the platform.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::events::SpotifyEvent;
use crate::platform::{ChangeEvent, ObjectState, OntologyPlatform, PlatformPlaylist};
use crate::poller::{PlaylistCache, SnapshotView};
use crate::service::PlaylistSnapshot;
use crate::subscription::Feed;
use crate::writers::{PlatformWriter, SpotifyWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The poller has not produced its baseline yet.
    NotReady,
    Create,
    Update,
    Unchanged,
}

pub fn matches_snapshot(object: &PlatformPlaylist, snapshot: &PlaylistSnapshot) -> bool {
    object.name == snapshot.name
        && object.description == snapshot.description
        && object.owner == snapshot.owner_id
        && object.tracks_count.matches(snapshot.track_count)
}

pub fn decide(cache: Option<&PlaylistCache>, object: &PlatformPlaylist) -> Decision {
    let Some(cache) = cache else {
        return Decision::NotReady;
    };
    match cache.get(&object.playlist_id) {
        None => Decision::Create,
        Some(snapshot) if matches_snapshot(object, snapshot) => Decision::Unchanged,
        Some(_) => Decision::Update,
    }
}

/// Applies platform playlist changes to the streaming service.
pub struct PlaylistReconciler {
    snapshots: SnapshotView,
    writer: SpotifyWriter,
    /// Last object written per playlist id, tagged with the cache generation
    /// it was written under. Only entries from the current generation guard
    /// against re-delivery; older ones are pruned on the next write.
    applied: Mutex<HashMap<String, (u64, PlatformPlaylist)>>,
}

impl PlaylistReconciler {
    pub fn new(snapshots: SnapshotView, writer: SpotifyWriter) -> Self {
        Self {
            snapshots,
            writer,
            applied: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, change: ChangeEvent<PlatformPlaylist>) -> Result<Decision> {
        let ChangeEvent { state, object } = change;
        if state == ObjectState::Removed {
            debug!(playlist_id = %object.playlist_id, "Ignoring removed platform playlist");
            return Ok(Decision::Unchanged);
        }

        let decision = self.snapshots.with(|cache| decide(cache, &object));
        match decision {
            Decision::NotReady => {
                info!(playlist_id = %object.playlist_id, "Playlist cache not ready, dropping change");
            }
            Decision::Unchanged => {
                self.applied_map().remove(&object.playlist_id);
            }
            Decision::Create | Decision::Update if self.already_applied(&object) => {
                debug!(playlist_id = %object.playlist_id, "Change already applied");
                return Ok(Decision::Unchanged);
            }
            Decision::Create => {
                info!(playlist_id = %object.playlist_id, "Playlist not in cache, creating");
                self.writer
                    .create_playlist(&object.owner, &object.name, &object.description)
                    .await?;
                self.mark_applied(object);
            }
            Decision::Update => {
                info!(playlist_id = %object.playlist_id, "Playlist differs from cache, updating");
                self.writer
                    .modify_playlist(&object.playlist_id, &object.name, &object.description)
                    .await?;
                self.mark_applied(object);
            }
        }
        Ok(decision)
    }

    fn applied_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, PlatformPlaylist)>> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn already_applied(&self, object: &PlatformPlaylist) -> bool {
        let generation = self.snapshots.generation();
        matches!(
            self.applied_map().get(&object.playlist_id),
            Some((g, applied)) if *g == generation && applied == object
        )
    }

    fn mark_applied(&self, object: PlatformPlaylist) {
        let generation = self.snapshots.generation();
        let mut applied = self.applied_map();
        applied.retain(|_, (g, _)| *g == generation);
        applied.insert(object.playlist_id.clone(), (generation, object));
    }
}

/// Feeds platform playlist changes into a [`PlaylistReconciler`].
pub struct PlaylistFeed {
    object_type: String,
    reconciler: Arc<PlaylistReconciler>,
}

impl PlaylistFeed {
    pub fn new(object_type: impl Into<String>, reconciler: Arc<PlaylistReconciler>) -> Self {
        Self {
            object_type: object_type.into(),
            reconciler,
        }
    }
}

#[async_trait]
impl Feed for PlaylistFeed {
    fn name(&self) -> &str {
        "playlists"
    }

    fn object_type(&self) -> &str {
        &self.object_type
    }

    async fn on_change(&self, change: ChangeEvent<Value>) {
        let ChangeEvent { state, object } = change;
        let object: PlatformPlaylist = match serde_json::from_value(object) {
            Ok(object) => object,
            Err(e) => {
                warn!(error = %SyncError::decode("platform playlist", e), "Ignoring playlist change");
                return;
            }
        };
        let playlist_id = object.playlist_id.clone();
        if let Err(e) = self.reconciler.handle(ChangeEvent { state, object }).await {
            error!(playlist_id = %playlist_id, error = %e, "Failed to reconcile playlist");
        }
    }
}

/// Mirrors streaming-service playlist events onto the platform.
pub struct PlatformReconciler {
    platform: Arc<dyn OntologyPlatform>,
    object_type: String,
    writer: PlatformWriter,
}

impl PlatformReconciler {
    pub fn new(
        platform: Arc<dyn OntologyPlatform>,
        object_type: impl Into<String>,
        writer: PlatformWriter,
    ) -> Self {
        Self {
            platform,
            object_type: object_type.into(),
            writer,
        }
    }

    /// Never fails; errors are logged.
    pub async fn handle(&self, event: &SpotifyEvent) {
        let result = match event {
            SpotifyEvent::PlaylistCreated(playlist) | SpotifyEvent::PlaylistModified(playlist) => {
                self.upsert(playlist).await
            }
            SpotifyEvent::PlaylistDeleted(playlist) => {
                info!(playlist_id = %playlist.id, "Deleting platform playlist");
                self.writer.delete_playlist(&playlist.id).await.map(|_| ())
            }
            SpotifyEvent::IsPlaying(_) | SpotifyEvent::TrackChanged(_) => Ok(()),
        };
        if let Err(e) = result {
            error!(event = event.name(), error = %e, "Failed to mirror playlist onto platform");
        }
    }

    async fn upsert(&self, playlist: &PlaylistSnapshot) -> Result<()> {
        let existing = self.platform.fetch_one(&self.object_type, &playlist.id).await?;
        match existing {
            Some(object) => {
                let key = object
                    .get("playlistId")
                    .and_then(Value::as_str)
                    .unwrap_or(playlist.id.as_str())
                    .to_string();
                info!(playlist_id = %playlist.id, "Modifying platform playlist");
                self.writer.modify_playlist(&key, playlist).await?;
            }
            None => {
                info!(playlist_id = %playlist.id, "Creating platform playlist");
                self.writer.create_playlist(playlist).await?;
            }
        }
        Ok(())
    }

    /// Handle events until the sending side is dropped.
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SpotifyEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(&event).await;
            }
        })
    }
}
