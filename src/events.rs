//! Typed fan-out of sync events and the skip-if-busy timer guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::service::{PlaylistSnapshot, TrackInformation};

/// Events produced by the streaming-service poller.
#[derive(Debug, Clone, PartialEq)]
pub enum SpotifyEvent {
    IsPlaying(bool),
    TrackChanged(Box<TrackInformation>),
    PlaylistCreated(PlaylistSnapshot),
    PlaylistModified(PlaylistSnapshot),
    PlaylistDeleted(PlaylistSnapshot),
}

impl SpotifyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SpotifyEvent::IsPlaying(_) => "isPlaying",
            SpotifyEvent::TrackChanged(_) => "trackChanged",
            SpotifyEvent::PlaylistCreated(_) => "playlistCreated",
            SpotifyEvent::PlaylistModified(_) => "playlistModified",
            SpotifyEvent::PlaylistDeleted(_) => "playlistDeleted",
        }
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Synchronous publish/subscribe over a closed set of event variants.
///
/// Handlers run on the publishing task, so they must not block; handlers
/// that need I/O forward the event into a channel.
pub struct EventBus<E> {
    handlers: RwLock<Vec<Handler<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    pub fn publish(&self, event: &E) {
        // Clone the list so a handler may subscribe without deadlocking.
        let handlers: Vec<Handler<E>> = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }
}

/// At-most-one-outstanding guard for a periodic job.
///
/// A tick that finds the flag taken is skipped, not queued.
#[derive(Debug, Default)]
pub struct BusyFlag(AtomicBool);

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.0))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flag on drop, including when the tick bails out early.
pub struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
