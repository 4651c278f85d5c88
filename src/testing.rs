//! In-memory fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::ingest::RecordSink;
use crate::platform::{FeedListener, FeedMessage, OntologyPlatform, PlatformSubscription};
use crate::service::{
    ArtistRef, AudioFeatures, CurrentlyPlaying, PlayingItem, PlaylistSnapshot, StreamingService,
};

pub fn playlist(id: &str, name: &str, track_count: u32) -> PlaylistSnapshot {
    PlaylistSnapshot {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        track_count,
        owner_id: "owner".to_string(),
        owner_display_name: "Owner".to_string(),
        snapshot_id: format!("{id}-snap"),
    }
}

pub fn now_playing(track_id: &str, is_playing: bool) -> CurrentlyPlaying {
    CurrentlyPlaying {
        is_playing,
        progress_ms: Some(1000),
        currently_playing_type: "track".to_string(),
        item: Some(PlayingItem {
            id: Some(track_id.to_string()),
            name: format!("Song {track_id}"),
            item_type: "track".to_string(),
            uri: Some(format!("spotify:track:{track_id}")),
            artists: vec![ArtistRef {
                name: "Band".to_string(),
            }],
            popularity: Some(50),
            preview_url: None,
        }),
    }
}

pub fn features(track_id: &str) -> AudioFeatures {
    AudioFeatures {
        id: track_id.to_string(),
        danceability: 0.5,
        energy: 0.7,
        key: 5,
        loudness: -6.0,
        mode: 1,
        speechiness: 0.04,
        acousticness: 0.1,
        instrumentalness: 0.0,
        liveness: 0.2,
        valence: 0.6,
        tempo: 120.0,
        duration_ms: 200_000,
        time_signature: 4,
    }
}

fn upstream_failure(method: &str) -> SyncError {
    SyncError::Upstream {
        service: "spotify",
        status: 500,
        message: format!("{method} failed"),
    }
}

#[derive(Default)]
struct SpotifyState {
    playlists: Vec<PlaylistSnapshot>,
    playing: Option<CurrentlyPlaying>,
    tracks: HashMap<String, Vec<String>>,
    calls: Vec<String>,
    failures: HashSet<String>,
    details_delay: Option<Duration>,
    added: Vec<(String, Vec<String>)>,
    removed: Vec<(String, Vec<String>)>,
    modified: Vec<(String, String, String)>,
    created: Vec<(String, String, String)>,
}

/// Streaming service backed by plain collections.
#[derive(Default)]
pub struct FakeSpotify {
    state: Mutex<SpotifyState>,
}

impl FakeSpotify {
    pub fn set_playlists(&self, playlists: Vec<PlaylistSnapshot>) {
        self.state.lock().unwrap().playlists = playlists;
    }

    pub fn set_playing(&self, playing: Option<CurrentlyPlaying>) {
        self.state.lock().unwrap().playing = playing;
    }

    pub fn set_tracks(&self, playlist_id: &str, uris: &[&str]) {
        self.state.lock().unwrap().tracks.insert(
            playlist_id.to_string(),
            uris.iter().map(|u| u.to_string()).collect(),
        );
    }

    /// Make every `playlist_details` call take `delay`.
    pub fn set_details_delay(&self, delay: Duration) {
        self.state.lock().unwrap().details_delay = Some(delay);
    }

    /// Make the next call to `method` fail once.
    pub fn fail_next(&self, method: &str) {
        self.state.lock().unwrap().failures.insert(method.to_string());
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn added(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().added.clone()
    }

    pub fn removed(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn modified(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().modified.clone()
    }

    pub fn created(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    fn call(&self, method: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(method.to_string());
        if state.failures.remove(method) {
            return Err(upstream_failure(method));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamingService for FakeSpotify {
    async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>> {
        self.call("currently_playing")?;
        Ok(self.state.lock().unwrap().playing.clone())
    }

    async fn user_playlists(&self) -> Result<Vec<PlaylistSnapshot>> {
        self.call("user_playlists")?;
        Ok(self.state.lock().unwrap().playlists.clone())
    }

    async fn playlist_details(&self, playlist_id: &str) -> Result<PlaylistSnapshot> {
        self.call("playlist_details")?;
        let delay = self.state.lock().unwrap().details_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .unwrap()
            .playlists
            .iter()
            .find(|p| p.id == playlist_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(playlist_id.to_string()))
    }

    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<String>> {
        self.call("playlist_tracks")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .tracks
            .get(playlist_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        self.call("add_tracks")?;
        let mut state = self.state.lock().unwrap();
        state
            .tracks
            .entry(playlist_id.to_string())
            .or_default()
            .extend(uris.iter().cloned());
        state.added.push((playlist_id.to_string(), uris.to_vec()));
        Ok(())
    }

    async fn remove_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        self.call("remove_tracks")?;
        let mut state = self.state.lock().unwrap();
        if let Some(tracks) = state.tracks.get_mut(playlist_id) {
            tracks.retain(|t| !uris.contains(t));
        }
        state.removed.push((playlist_id.to_string(), uris.to_vec()));
        Ok(())
    }

    async fn modify_playlist(&self, playlist_id: &str, name: &str, description: &str) -> Result<()> {
        self.call("modify_playlist")?;
        self.state.lock().unwrap().modified.push((
            playlist_id.to_string(),
            name.to_string(),
            description.to_string(),
        ));
        Ok(())
    }

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        description: &str,
    ) -> Result<PlaylistSnapshot> {
        self.call("create_playlist")?;
        let mut state = self.state.lock().unwrap();
        state.created.push((
            user_id.to_string(),
            name.to_string(),
            description.to_string(),
        ));
        let mut created = playlist(&format!("new-{}", state.created.len()), name, 0);
        created.description = description.to_string();
        created.owner_id = user_id.to_string();
        Ok(created)
    }

    async fn audio_features(&self, track_id: &str) -> Result<AudioFeatures> {
        self.call("audio_features")?;
        Ok(features(track_id))
    }

    async fn audio_analysis(&self, track_id: &str) -> Result<Value> {
        self.call("audio_analysis")?;
        Ok(json!({ "track": { "id": track_id } }))
    }
}

struct FakeSubscription {
    closed: Arc<AtomicBool>,
}

impl PlatformSubscription for FakeSubscription {
    fn unsubscribe(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct OpenedFeed {
    object_type: String,
    listener: FeedListener,
    closed: Arc<AtomicBool>,
}

/// Ontology platform whose change feeds are driven by the test.
#[derive(Default)]
pub struct FakePlatform {
    feeds: Mutex<Vec<OpenedFeed>>,
    actions: Mutex<Vec<(String, Value)>>,
    objects: Mutex<HashMap<(String, String), Value>>,
    fail_actions: AtomicBool,
}

impl FakePlatform {
    pub fn subscribe_count(&self) -> usize {
        self.feeds.lock().unwrap().len()
    }

    pub fn subscribed_types(&self) -> Vec<String> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.object_type.clone())
            .collect()
    }

    /// Deliver `message` on the listener of the `index`-th subscription.
    pub fn send(&self, index: usize, message: FeedMessage) {
        let feeds = self.feeds.lock().unwrap();
        let _ = feeds[index].listener.send(message);
    }

    pub fn send_latest(&self, message: FeedMessage) {
        let index = self.subscribe_count() - 1;
        self.send(index, message);
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.feeds.lock().unwrap()[index].closed.load(Ordering::SeqCst)
    }

    pub fn insert_object(&self, object_type: &str, primary_key: &str, object: Value) {
        self.objects
            .lock()
            .unwrap()
            .insert((object_type.to_string(), primary_key.to_string()), object);
    }

    pub fn actions(&self) -> Vec<(String, Value)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OntologyPlatform for FakePlatform {
    fn subscribe(&self, object_type: &str, listener: FeedListener) -> Box<dyn PlatformSubscription> {
        let closed = Arc::new(AtomicBool::new(false));
        self.feeds.lock().unwrap().push(OpenedFeed {
            object_type: object_type.to_string(),
            listener,
            closed: closed.clone(),
        });
        Box::new(FakeSubscription { closed })
    }

    async fn apply_action(&self, action: &str, params: Value) -> Result<Value> {
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(SyncError::Upstream {
                service: "platform",
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.actions
            .lock()
            .unwrap()
            .push((action.to_string(), params));
        Ok(Value::Null)
    }

    async fn fetch_one(&self, object_type: &str, primary_key: &str) -> Result<Option<Value>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(object_type.to_string(), primary_key.to_string()))
            .cloned())
    }
}

/// Record sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<(String, Value)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn push_records(&self, stream: &str, records: Vec<Value>) -> Result<()> {
        let mut stored = self.records.lock().unwrap();
        stored.extend(records.into_iter().map(|r| (stream.to_string(), r)));
        Ok(())
    }
}
