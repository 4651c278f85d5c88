//! Polls the streaming service and turns state differences into events.
//!
//! Two independent timers run once started: playback state every second and
//! the playlist listing on a configurable period. Each timer is guarded by a
//! [`BusyFlag`], so a slow upstream response causes ticks to be skipped
//! instead of piling up. Errors end the tick and are logged; the next tick is
//! the retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{BusyFlag, EventBus, SpotifyEvent};
use crate::service::{PlaylistSnapshot, StreamingService, TrackInformation};

pub const PLAYBACK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PLAYLIST_INTERVAL: Duration = Duration::from_secs(5);

pub type PlaylistCache = HashMap<String, PlaylistSnapshot>;

/// Read-only access to the poller's playlist snapshot cache.
///
/// The cache is `None` until the first playlist poll has succeeded. The
/// generation counts successful polls.
#[derive(Clone, Default)]
pub struct SnapshotView {
    cache: Arc<RwLock<Option<PlaylistCache>>>,
    generation: Arc<AtomicU64>,
}

impl SnapshotView {
    pub fn is_ready(&self) -> bool {
        self.cache.read().map(|cache| cache.is_some()).unwrap_or(false)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, playlist_id: &str) -> Option<PlaylistSnapshot> {
        self.cache
            .read()
            .ok()?
            .as_ref()?
            .get(playlist_id)
            .cloned()
    }

    /// Run `f` against the cache without copying it.
    pub fn with<R>(&self, f: impl FnOnce(Option<&PlaylistCache>) -> R) -> R {
        match self.cache.read() {
            Ok(cache) => f(cache.as_ref()),
            Err(_) => f(None),
        }
    }

    /// Diff `listing` against the cache, store it and start a new generation.
    pub(crate) fn replace(&self, listing: Vec<PlaylistSnapshot>) -> Vec<SpotifyEvent> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let events = apply_listing(&mut cache, listing);
        self.generation.fetch_add(1, Ordering::AcqRel);
        events
    }

    #[cfg(test)]
    pub(crate) fn from_cache(cache: Option<PlaylistCache>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(cache)),
            generation: Arc::default(),
        }
    }
}

#[derive(Debug, Default)]
struct PlaybackState {
    /// `None` until the first response, so the first state is always published.
    is_playing: Option<bool>,
    track_id: Option<String>,
}

pub struct SpotifyPoller {
    service: Arc<dyn StreamingService>,
    events: Arc<EventBus<SpotifyEvent>>,
    playback_interval: Duration,
    playlist_interval: Duration,
    playback: Mutex<PlaybackState>,
    cache: SnapshotView,
    playback_busy: BusyFlag,
    playlist_busy: BusyFlag,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpotifyPoller {
    pub fn new(
        service: Arc<dyn StreamingService>,
        events: Arc<EventBus<SpotifyEvent>>,
        playlist_interval: Duration,
    ) -> Self {
        Self {
            service,
            events,
            playback_interval: PLAYBACK_INTERVAL,
            playlist_interval,
            playback: Mutex::new(PlaybackState::default()),
            cache: SnapshotView::default(),
            playback_busy: BusyFlag::new(),
            playlist_busy: BusyFlag::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_playback_interval(mut self, playback_interval: Duration) -> Self {
        self.playback_interval = playback_interval;
        self
    }

    pub fn events(&self) -> &Arc<EventBus<SpotifyEvent>> {
        &self.events
    }

    pub fn snapshots(&self) -> SnapshotView {
        self.cache.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Start both timers. Calling this while running only logs a warning.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() {
            warn!("Spotify poller already started");
            return;
        }

        let poller = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(poller.playback_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; playback starts one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                poller.poll_playback().await;
            }
        }));

        let poller = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(poller.playlist_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poller.poll_playlists().await;
            }
        }));

        info!(
            playlist_interval_ms = self.playlist_interval.as_millis() as u64,
            "Spotify poller started"
        );
    }

    pub fn stop(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Spotify poller stopped");
    }

    /// One playback tick. Skipped if the previous one is still running.
    pub async fn poll_playback(&self) {
        let Some(_guard) = self.playback_busy.try_acquire() else {
            debug!("Playback poll still in flight, skipping tick");
            return;
        };
        if let Err(e) = self.update_playback().await {
            if e.is_transient() {
                warn!(error = %e, "Error updating playback state");
            } else {
                error!(error = %e, "Error updating playback state");
            }
        }
    }

    /// One playlist tick. Skipped if the previous one is still running.
    pub async fn poll_playlists(&self) {
        let Some(_guard) = self.playlist_busy.try_acquire() else {
            debug!("Playlist poll still in flight, skipping tick");
            return;
        };
        if let Err(e) = self.update_playlists().await {
            if e.is_transient() {
                warn!(error = %e, "Error updating playlists");
            } else {
                error!(error = %e, "Error updating playlists");
            }
        }
    }

    async fn update_playback(&self) -> Result<()> {
        let Some(current) = self.service.currently_playing().await? else {
            return Ok(());
        };

        let (playing_changed, new_track) = {
            let mut state = self.playback.lock().unwrap_or_else(|e| e.into_inner());
            let playing_changed = state.is_playing != Some(current.is_playing);
            state.is_playing = Some(current.is_playing);

            let new_track = match current.track_id() {
                Some(id) if state.track_id.as_deref() != Some(id) => {
                    // Recorded before the feature fetch: a failed fetch drops
                    // this track's event rather than retrying every second.
                    state.track_id = Some(id.to_string());
                    Some(id.to_string())
                }
                _ => None,
            };
            (playing_changed, new_track)
        };

        if playing_changed {
            self.events.publish(&SpotifyEvent::IsPlaying(current.is_playing));
        }

        if let Some(id) = new_track {
            let (analysis, features) = tokio::try_join!(
                self.service.audio_analysis(&id),
                self.service.audio_features(&id)
            )?;
            debug!(track_id = %id, "Track changed");
            self.events
                .publish(&SpotifyEvent::TrackChanged(Box::new(TrackInformation {
                    id,
                    currently_playing: current,
                    analysis,
                    features,
                })));
        }

        Ok(())
    }

    async fn update_playlists(&self) -> Result<()> {
        let listing = self.service.user_playlists().await?;
        let events = self.cache.replace(listing);
        for event in &events {
            self.events.publish(event);
        }
        Ok(())
    }
}

/// Diff a fresh listing against the cache and replace the cache with it.
///
/// The first listing only establishes the baseline.
pub fn apply_listing(
    cache: &mut Option<PlaylistCache>,
    listing: Vec<PlaylistSnapshot>,
) -> Vec<SpotifyEvent> {
    if cache.is_none() {
        info!(count = listing.len(), "Playlist baseline established");
        *cache = Some(listing.into_iter().map(|p| (p.id.clone(), p)).collect());
        return Vec::new();
    }
    let Some(previous) = cache.as_mut() else {
        return Vec::new();
    };

    let mut events = Vec::new();
    let mut current = PlaylistCache::with_capacity(listing.len());

    for playlist in listing {
        match previous.get(&playlist.id) {
            None => events.push(SpotifyEvent::PlaylistCreated(playlist.clone())),
            Some(cached) if cached.differs_from(&playlist) => {
                events.push(SpotifyEvent::PlaylistModified(playlist.clone()))
            }
            Some(_) => {}
        }
        current.insert(playlist.id.clone(), playlist);
    }

    let mut deleted: Vec<&PlaylistSnapshot> = previous
        .values()
        .filter(|p| !current.contains_key(&p.id))
        .collect();
    deleted.sort_by(|a, b| a.id.cmp(&b.id));
    events.extend(
        deleted
            .into_iter()
            .map(|p| SpotifyEvent::PlaylistDeleted(p.clone())),
    );

    *previous = current;
    events
}
