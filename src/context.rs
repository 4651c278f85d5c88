//! Startup wiring: the shared clients and the set of running components.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::batcher::{PlaylistTrackFeed, TrackBatcher};
use crate::config::Config;
use crate::credentials::CredentialCache;
use crate::error::Result;
use crate::events::{EventBus, SpotifyEvent};
use crate::ingest::{Ingestor, RecordSink};
use crate::platform::http::HttpPlatform;
use crate::platform::OntologyPlatform;
use crate::poller::SpotifyPoller;
use crate::reconcile::{PlatformReconciler, PlaylistFeed, PlaylistReconciler};
use crate::service::{SpotifyAccounts, SpotifyClient, StreamingService};
use crate::subscription::ChangeSubscription;
use crate::writers::{PlatformWriter, SpotifyWriter};

/// Clients built once at startup and handed to every component.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Config,
    pub spotify: Arc<dyn StreamingService>,
    pub platform: Arc<dyn OntologyPlatform>,
    pub sink: Arc<dyn RecordSink>,
}

impl SyncContext {
    pub fn new(
        config: Config,
        spotify: Arc<dyn StreamingService>,
        platform: Arc<dyn OntologyPlatform>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            config,
            spotify,
            platform,
            sink,
        }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let accounts = SpotifyAccounts::new(
            config.spotify.accounts_url.clone(),
            config.spotify.client_id.clone(),
            config.spotify.client_secret.clone(),
        );
        let credentials = Arc::new(CredentialCache::from_tokens(
            config.spotify.access_token.clone(),
            config.spotify.refresh_token.clone(),
            config.spotify.scope.clone(),
            Arc::new(accounts),
        ));
        let spotify = Arc::new(SpotifyClient::new(
            config.spotify.api_url.clone(),
            credentials,
        )?);
        let platform = Arc::new(HttpPlatform::new(
            config.platform.url.clone(),
            config.platform.token.clone(),
            config.platform.ontology.clone(),
        )?);

        Ok(Self::new(config, spotify, platform.clone(), platform))
    }
}

/// Everything started by [`Daemon::start`].
pub struct Daemon {
    poller: Arc<SpotifyPoller>,
    batcher: Arc<TrackBatcher>,
    subscriptions: Vec<ChangeSubscription>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn start(ctx: &SyncContext) -> Self {
        let sync = &ctx.config.sync;
        let events = Arc::new(EventBus::new());

        let poller = Arc::new(
            SpotifyPoller::new(ctx.spotify.clone(), events.clone(), sync.playlist_interval())
                .with_playback_interval(sync.playback_interval()),
        );

        let mut workers = Vec::new();

        let reconciler = Arc::new(PlatformReconciler::new(
            ctx.platform.clone(),
            ctx.config.platform.playlist_object_type.clone(),
            PlatformWriter::new(ctx.platform.clone(), ctx.config.platform.actions.clone()),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        events.subscribe(move |event: &SpotifyEvent| {
            if matches!(
                event,
                SpotifyEvent::PlaylistCreated(_)
                    | SpotifyEvent::PlaylistModified(_)
                    | SpotifyEvent::PlaylistDeleted(_)
            ) {
                let _ = tx.send(event.clone());
            }
        });
        workers.push(reconciler.spawn(rx));

        if ctx.config.ingest.enabled {
            let ingestor = Ingestor::new(ctx.sink.clone(), ctx.config.platform.streams.clone());
            let (tx, rx) = mpsc::unbounded_channel();
            events.subscribe(move |event: &SpotifyEvent| {
                let _ = tx.send(event.clone());
            });
            workers.push(ingestor.spawn(rx));
        }

        let batcher = Arc::new(TrackBatcher::new(
            ctx.spotify.clone(),
            sync.name_filter.clone(),
            sync.flush_interval(),
        ));

        let playlist_reconciler = Arc::new(PlaylistReconciler::new(
            poller.snapshots(),
            SpotifyWriter::new(ctx.spotify.clone()),
        ));
        let options = sync.subscription_options();
        let subscriptions = vec![
            ChangeSubscription::start(
                ctx.platform.clone(),
                Arc::new(PlaylistFeed::new(
                    ctx.config.platform.playlist_object_type.clone(),
                    playlist_reconciler,
                )),
                options,
            ),
            ChangeSubscription::start(
                ctx.platform.clone(),
                Arc::new(PlaylistTrackFeed::new(
                    ctx.config.platform.track_object_type.clone(),
                    batcher.clone(),
                )),
                options,
            ),
        ];

        poller.start();
        batcher.start();
        info!(ingest = ctx.config.ingest.enabled, "Sync daemon started");

        Self {
            poller,
            batcher,
            subscriptions,
            workers,
        }
    }

    pub fn poller(&self) -> &Arc<SpotifyPoller> {
        &self.poller
    }

    pub fn batcher(&self) -> &Arc<TrackBatcher> {
        &self.batcher
    }

    /// Stop feeds first so nothing new is recorded, then the timers.
    pub async fn shutdown(self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe().await;
        }
        self.poller.stop();
        self.batcher.stop().await;
        for worker in self.workers {
            worker.abort();
        }
        info!("Sync daemon stopped");
    }
}
