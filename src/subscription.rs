//! Resilient change-feed subscriptions.
//!
//! A [`ChangeSubscription`] owns one actor task per feed. The actor opens the
//! platform subscription, forwards changes to its [`Feed`], re-subscribes on a
//! fixed refresh period and reconnects with capped exponential backoff when
//! the platform closes the feed. Every subscription gets its own channel, so
//! messages from a replaced subscription are dropped with the old receiver.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::platform::{ChangeEvent, FeedMessage, OntologyPlatform, PlatformSubscription};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub refresh_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
        }
    }
}

/// `min(base * 2^attempts, max)`
pub fn reconnect_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempts)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Idle,
    Subscribing,
    Active,
    Reconnecting,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub phase: SubscriptionPhase,
    pub reconnect_attempts: u32,
}

/// Consumer side of one change feed.
#[async_trait]
pub trait Feed: Send + Sync + 'static {
    /// Used in log lines.
    fn name(&self) -> &str;

    fn object_type(&self) -> &str;

    async fn on_change(&self, change: ChangeEvent<Value>);
}

pub struct ChangeSubscription {
    name: String,
    shutdown: watch::Sender<bool>,
    status: Arc<Mutex<SubscriptionStatus>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChangeSubscription {
    /// Spawn the actor and open the first subscription.
    pub fn start(
        platform: Arc<dyn OntologyPlatform>,
        feed: Arc<dyn Feed>,
        options: SubscriptionOptions,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let status = Arc::new(Mutex::new(SubscriptionStatus {
            phase: SubscriptionPhase::Idle,
            reconnect_attempts: 0,
        }));
        let name = feed.name().to_string();

        let actor = Actor {
            platform,
            feed,
            options,
            status: Arc::clone(&status),
            handle: None,
            receiver: None,
            reconnect_at: None,
        };
        let task = tokio::spawn(actor.run(shutdown_rx));

        Self {
            name,
            shutdown,
            status,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.status().phase
    }

    /// Close the feed and cancel the refresh and reconnect timers. Safe to
    /// call more than once.
    pub async fn unsubscribe(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().await.take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            warn!(feed = %self.name, error = %e, "Subscription task ended abnormally");
        }
        set_phase(&self.status, SubscriptionPhase::Unsubscribed);
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn set_phase(status: &Mutex<SubscriptionStatus>, phase: SubscriptionPhase) {
    status.lock().unwrap_or_else(|e| e.into_inner()).phase = phase;
}

struct Actor {
    platform: Arc<dyn OntologyPlatform>,
    feed: Arc<dyn Feed>,
    options: SubscriptionOptions,
    status: Arc<Mutex<SubscriptionStatus>>,
    handle: Option<Box<dyn PlatformSubscription>>,
    receiver: Option<mpsc::UnboundedReceiver<FeedMessage>>,
    reconnect_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.open();

        let period = self.options.refresh_interval;
        let mut refresh = interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                _ = shutdown.changed() => break,
                message = next_message(&mut self.receiver) => match message {
                    Some(message) => self.handle_message(message).await,
                    None => self.closed("listener dropped"),
                },
                _ = refresh.tick() => self.refresh(),
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect();
                }
            }
        }

        self.close_handle();
        self.reconnect_at = None;
        set_phase(&self.status, SubscriptionPhase::Unsubscribed);
        info!(feed = %self.feed.name(), "Unsubscribed");
    }

    fn open(&mut self) {
        self.reconnect_at = None;
        set_phase(&self.status, SubscriptionPhase::Subscribing);
        let (listener, receiver) = mpsc::unbounded_channel();
        self.handle = Some(self.platform.subscribe(self.feed.object_type(), listener));
        self.receiver = Some(receiver);
        debug!(feed = %self.feed.name(), "Subscribing");
    }

    fn close_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.unsubscribe();
        }
        self.receiver = None;
    }

    async fn handle_message(&mut self, message: FeedMessage) {
        match message {
            FeedMessage::Subscribed => self.subscribed(),
            FeedMessage::Change { state, object } => {
                self.feed.on_change(ChangeEvent { state, object }).await;
            }
            FeedMessage::OutOfDate => {
                info!(feed = %self.feed.name(), status = %SyncError::DataStale, "Change feed notice");
            }
            FeedMessage::Error {
                message,
                subscription_closed,
            } => {
                if subscription_closed {
                    self.closed(&message);
                } else {
                    warn!(feed = %self.feed.name(), error = %message, "Change feed error");
                }
            }
        }
    }

    fn subscribed(&mut self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.phase = SubscriptionPhase::Active;
        status.reconnect_attempts = 0;
        info!(feed = %self.feed.name(), "Subscribed");
    }

    fn closed(&mut self, reason: &str) {
        self.close_handle();
        let attempts = {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            let attempts = status.reconnect_attempts;
            status.reconnect_attempts += 1;
            status.phase = SubscriptionPhase::Reconnecting;
            attempts
        };
        let delay = reconnect_delay(
            attempts,
            self.options.reconnect_base,
            self.options.reconnect_max,
        );
        self.reconnect_at = Some(Instant::now() + delay);
        warn!(
            feed = %self.feed.name(),
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            attempt = attempts + 1,
            "Subscription closed, scheduling reconnect"
        );
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        if self.handle.is_some() {
            debug!(feed = %self.feed.name(), "Already subscribed, reconnect skipped");
            return;
        }
        self.open();
    }

    fn refresh(&mut self) {
        info!(feed = %self.feed.name(), "Refreshing subscription");
        self.close_handle();
        self.open();
    }
}

async fn next_message(
    receiver: &mut Option<mpsc::UnboundedReceiver<FeedMessage>>,
) -> Option<FeedMessage> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
