//! Collapses playlist-track changes from the platform and flushes them to
//! the streaming service in per-playlist batches.
//!
//! Pending work is keyed by playlist and then by the membership's primary
//! key, so at most one operation is ever pending for a membership. A flush
//! reads a snapshot, applies it and then removes only the entries it
//! actually sent; anything recorded while the flush was in flight stays.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::events::BusyFlag;
use crate::platform::{ChangeEvent, ObjectState, PlatformPlaylistTrack};
use crate::service::StreamingService;
use crate::subscription::Feed;
use crate::writers::SpotifyWriter;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOperation {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackOperationEntry {
    pub track: PlatformPlaylistTrack,
    pub operation: TrackOperation,
}

/// playlist id -> membership key -> pending operation
#[derive(Debug, Default)]
pub struct PendingOperations {
    playlists: HashMap<String, HashMap<String, TrackOperationEntry>>,
}

impl PendingOperations {
    pub fn record(&mut self, track: PlatformPlaylistTrack, operation: TrackOperation) {
        let entries = self.playlists.entry(track.playlist_id.clone()).or_default();
        let previous = entries.get(&track.key).map(|e| e.operation);

        match (previous, operation) {
            (Some(TrackOperation::Add), TrackOperation::Delete) => {
                // Never reached the service; nothing to undo.
                entries.remove(&track.key);
            }
            _ => {
                entries.insert(track.key.clone(), TrackOperationEntry { track, operation });
            }
        }

        self.playlists.retain(|_, entries| !entries.is_empty());
    }

    pub fn get(&self, playlist_id: &str, key: &str) -> Option<&TrackOperationEntry> {
        self.playlists.get(playlist_id)?.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.playlists.is_empty()
    }

    pub fn len(&self) -> usize {
        self.playlists.values().map(HashMap::len).sum()
    }

    pub fn playlist_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.playlists.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, playlist_id: &str) -> Vec<TrackOperationEntry> {
        self.playlists
            .get(playlist_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove each flushed entry unless it was replaced in the meantime.
    pub fn remove_flushed(&mut self, playlist_id: &str, flushed: &[TrackOperationEntry]) {
        let Some(entries) = self.playlists.get_mut(playlist_id) else {
            return;
        };
        for entry in flushed {
            if entries.get(&entry.track.key) == Some(entry) {
                entries.remove(&entry.track.key);
            }
        }
        if entries.is_empty() {
            self.playlists.remove(playlist_id);
        }
    }
}

/// Only playlists whose name passes every configured test are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameFilter {
    pub prefix: Option<String>,
    pub contains: Option<String>,
}

impl NameFilter {
    pub fn allows(&self, name: &str) -> bool {
        let prefix_ok = self.prefix.as_deref().map_or(true, |p| name.starts_with(p));
        let contains_ok = self.contains.as_deref().map_or(true, |c| name.contains(c));
        prefix_ok && contains_ok
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_none() && self.contains.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaylistOutcome {
    Flushed { added: usize, removed: usize },
    Filtered,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: Vec<String>,
    pub filtered: Vec<String>,
    /// Playlists gone from the service; their operations were dropped.
    pub missing: Vec<String>,
    pub failed: Vec<String>,
    pub added: usize,
    pub removed: usize,
}

pub struct TrackBatcher {
    service: Arc<dyn StreamingService>,
    writer: SpotifyWriter,
    name_filter: NameFilter,
    flush_interval: Duration,
    pending: Mutex<PendingOperations>,
    busy: BusyFlag,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrackBatcher {
    pub fn new(
        service: Arc<dyn StreamingService>,
        name_filter: NameFilter,
        flush_interval: Duration,
    ) -> Self {
        Self {
            writer: SpotifyWriter::new(Arc::clone(&service)),
            service,
            name_filter,
            flush_interval,
            pending: Mutex::new(PendingOperations::default()),
            busy: BusyFlag::new(),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    pub fn record(&self, change: ChangeEvent<PlatformPlaylistTrack>) {
        let operation = match change.state {
            ObjectState::AddedOrUpdated => TrackOperation::Add,
            ObjectState::Removed => TrackOperation::Delete,
        };
        debug!(
            playlist_id = %change.object.playlist_id,
            key = %change.object.key,
            ?operation,
            "Recording track operation"
        );
        self.lock_pending().record(change.object, operation);
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn pending_entry(&self, playlist_id: &str, key: &str) -> Option<TrackOperationEntry> {
        self.lock_pending().get(playlist_id, key).cloned()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingOperations> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(self: &Arc<Self>) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            warn!("Track batcher already started");
            return;
        }
        let batcher = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(batcher.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                // A flush in progress runs to completion before shutdown is seen.
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        batcher.flush().await;
                    }
                }
            }
        }));
        info!(
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "Track batcher started"
        );
    }

    /// Stop the timer, wait for any running flush, then push out whatever
    /// is still pending.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Track batcher task ended abnormally");
            }
        }
        let report = self.flush().await;
        let left = self.pending_len();
        if left > 0 {
            warn!(
                operations = left,
                failed = ?report.failed,
                filtered = ?report.filtered,
                "Pending track operations dropped at shutdown"
            );
        }
        info!("Track batcher stopped");
    }

    /// Write every pending playlist. A tick that overlaps a running flush is
    /// skipped.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(_guard) = self.busy.try_acquire() else {
            debug!("Flush still in flight, skipping tick");
            return report;
        };

        let playlist_ids = {
            let pending = self.lock_pending();
            if pending.is_empty() {
                return report;
            }
            pending.playlist_ids()
        };

        for playlist_id in playlist_ids {
            let entries = self.lock_pending().snapshot(&playlist_id);
            if entries.is_empty() {
                continue;
            }
            match self.flush_playlist(&playlist_id, &entries).await {
                Ok(PlaylistOutcome::Flushed { added, removed }) => {
                    self.lock_pending().remove_flushed(&playlist_id, &entries);
                    report.added += added;
                    report.removed += removed;
                    report.flushed.push(playlist_id);
                }
                Ok(PlaylistOutcome::Filtered) => report.filtered.push(playlist_id),
                Err(SyncError::NotFound(_)) => {
                    warn!(
                        playlist_id = %playlist_id,
                        operations = entries.len(),
                        "Playlist not found, dropping its track operations"
                    );
                    self.lock_pending().remove_flushed(&playlist_id, &entries);
                    report.missing.push(playlist_id);
                }
                Err(e) => {
                    error!(playlist_id = %playlist_id, error = %e, "Failed to flush playlist tracks");
                    report.failed.push(playlist_id);
                }
            }
        }
        report
    }

    async fn flush_playlist(
        &self,
        playlist_id: &str,
        entries: &[TrackOperationEntry],
    ) -> Result<PlaylistOutcome> {
        let details = self.service.playlist_details(playlist_id).await?;
        if !self.name_filter.allows(&details.name) {
            debug!(playlist_id = %playlist_id, name = %details.name, "Playlist filtered, keeping operations");
            return Ok(PlaylistOutcome::Filtered);
        }

        let mut adds = Vec::new();
        let mut deletes = Vec::new();
        for entry in entries {
            match entry.operation {
                TrackOperation::Add => adds.push(entry.track.song_id.clone()),
                TrackOperation::Delete => deletes.push(entry.track.song_id.clone()),
            }
        }

        let mut added = 0;
        if !adds.is_empty() {
            let existing: HashSet<String> = self
                .service
                .playlist_tracks(playlist_id)
                .await?
                .into_iter()
                .collect();
            let uris = unique(adds.into_iter().filter(|uri| !existing.contains(uri)));
            self.writer.add_tracks(playlist_id, &uris).await?;
            added = uris.len();
        }

        let deletes = unique(deletes);
        self.writer.remove_tracks(playlist_id, &deletes).await?;

        Ok(PlaylistOutcome::Flushed {
            added,
            removed: deletes.len(),
        })
    }
}

fn unique(uris: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    uris.into_iter().filter(|uri| seen.insert(uri.clone())).collect()
}

/// Feeds playlist-membership changes into a [`TrackBatcher`].
pub struct PlaylistTrackFeed {
    object_type: String,
    batcher: Arc<TrackBatcher>,
}

impl PlaylistTrackFeed {
    pub fn new(object_type: impl Into<String>, batcher: Arc<TrackBatcher>) -> Self {
        Self {
            object_type: object_type.into(),
            batcher,
        }
    }
}

#[async_trait]
impl Feed for PlaylistTrackFeed {
    fn name(&self) -> &str {
        "playlist-tracks"
    }

    fn object_type(&self) -> &str {
        &self.object_type
    }

    async fn on_change(&self, change: ChangeEvent<Value>) {
        let ChangeEvent { state, object } = change;
        match serde_json::from_value::<PlatformPlaylistTrack>(object) {
            Ok(object) => self.batcher.record(ChangeEvent { state, object }),
            Err(e) => warn!(
                error = %SyncError::decode("playlist track", e),
                "Ignoring playlist-track change"
            ),
        }
    }
}
