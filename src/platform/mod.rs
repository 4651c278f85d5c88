//! The ontology platform side: object types, change-feed messages and the
//! client interface the sync engine consumes.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Normalized state of a change-feed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectState {
    AddedOrUpdated,
    Removed,
}

/// One decoded change for a feed's object type.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub state: ObjectState,
    pub object: T,
}

/// Everything a platform subscription can report to its listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedMessage {
    Subscribed,
    Change {
        state: ObjectState,
        object: Value,
    },
    OutOfDate,
    Error {
        message: String,
        #[serde(default, rename = "subscriptionClosed")]
        subscription_closed: bool,
    },
}

pub type FeedListener = mpsc::UnboundedSender<FeedMessage>;

/// A live upstream subscription.
pub trait PlatformSubscription: Send {
    fn unsubscribe(&mut self);
}

/// Client interface of the ontology platform.
#[async_trait]
pub trait OntologyPlatform: Send + Sync {
    /// Open a change feed for `object_type`. Returns immediately; the outcome
    /// arrives on `listener` as `Subscribed` or a closing `Error`.
    fn subscribe(&self, object_type: &str, listener: FeedListener)
        -> Box<dyn PlatformSubscription>;

    async fn apply_action(&self, action: &str, params: Value) -> Result<Value>;

    /// `None` when no object has that primary key.
    async fn fetch_one(&self, object_type: &str, primary_key: &str) -> Result<Option<Value>>;
}

/// Track count as stored on the platform: a number on create, its string
/// rendering after modify. Compared by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackCount {
    Number(u64),
    Text(String),
}

impl TrackCount {
    pub fn value(&self) -> Option<u64> {
        match self {
            TrackCount::Number(n) => Some(*n),
            TrackCount::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn matches(&self, count: u32) -> bool {
        match self.value() {
            Some(n) => n == u64::from(count),
            None => matches!(self, TrackCount::Text(s) if *s == count.to_string()),
        }
    }
}

impl PartialEq for TrackCount {
    fn eq(&self, other: &Self) -> bool {
        match (self.value(), other.value()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (TrackCount::Text(a), TrackCount::Text(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Default for TrackCount {
    fn default() -> Self {
        TrackCount::Number(0)
    }
}

/// Playlist object on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPlaylist {
    pub playlist_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner: String,
    #[serde(default)]
    pub tracks_count: TrackCount,
}

/// Playlist membership object on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPlaylistTrack {
    /// Opaque membership identity.
    #[serde(rename = "$primaryKey")]
    pub key: String,
    pub playlist_id: String,
    /// Track URI on the streaming service.
    pub song_id: String,
}
