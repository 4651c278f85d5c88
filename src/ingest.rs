//! Forwards poller events to the platform's record streams.
//!
//! Each event becomes zero or more rows; a stream without a configured
//! name is simply not written.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::SpotifyEvent;
use crate::service::{AudioFeatures, PlaylistSnapshot, TrackInformation};

/// Destination for JSON records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn push_records(&self, stream: &str, records: Vec<Value>) -> Result<()>;
}

/// Stream names per row kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestStreams {
    pub now_playing: Option<String>,
    pub tracks: Option<String>,
    pub track_features: Option<String>,
    pub playlists: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NowPlayingRow {
    pub timestamp: i64,
    pub track_id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub progress_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackRow {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub popularity: Option<u32>,
    pub preview_url: Option<String>,
    #[serde(rename = "isDeleted")]
    pub is_deleted: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackFeaturesRow {
    #[serde(flatten)]
    pub features: AudioFeatures,
    pub timestamp: i64,
    #[serde(rename = "isDeleted")]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub snapshot_id: String,
    pub tracks_total: u32,
    pub owner_id: String,
    pub owner_name: String,
    #[serde(rename = "lastModified")]
    pub last_modified: i64,
    #[serde(rename = "isDeleted")]
    pub is_deleted: bool,
    pub operation: RowOperation,
}

impl PlaylistRow {
    fn new(playlist: &PlaylistSnapshot, operation: RowOperation, now_ms: i64) -> Self {
        Self {
            id: playlist.id.clone(),
            name: playlist.name.clone(),
            description: playlist.description.clone(),
            snapshot_id: playlist.snapshot_id.clone(),
            tracks_total: playlist.track_count,
            owner_id: playlist.owner_id.clone(),
            owner_name: playlist.owner_display_name.clone(),
            last_modified: now_ms,
            is_deleted: operation == RowOperation::Delete,
            operation,
        }
    }
}

/// Rows produced by one event, paired with the stream they belong to.
pub fn rows_for(event: &SpotifyEvent, streams: &IngestStreams, now_ms: i64) -> Vec<(String, Value)> {
    let mut rows = Vec::new();
    let mut push = |stream: &Option<String>, row: Result<Value>| push_row(&mut rows, stream, row);

    match event {
        SpotifyEvent::IsPlaying(_) => {}
        SpotifyEvent::TrackChanged(info) => {
            let TrackInformation {
                id,
                currently_playing,
                features,
                ..
            } = info.as_ref();
            push(
                &streams.now_playing,
                to_value(&NowPlayingRow {
                    timestamp: now_ms,
                    track_id: id.clone(),
                    item_type: "track".to_string(),
                    progress_ms: currently_playing.progress_ms,
                }),
            );
            if let Some(item) = currently_playing.item.as_ref().filter(|i| i.item_type == "track") {
                push(
                    &streams.tracks,
                    to_value(&TrackRow {
                        id: id.clone(),
                        name: item.name.clone(),
                        artists: item.artists.iter().map(|a| a.name.clone()).collect(),
                        popularity: item.popularity,
                        preview_url: item.preview_url.clone(),
                        is_deleted: false,
                        timestamp: now_ms,
                    }),
                );
            }
            push(
                &streams.track_features,
                to_value(&TrackFeaturesRow {
                    features: features.clone(),
                    timestamp: now_ms,
                    is_deleted: false,
                }),
            );
        }
        SpotifyEvent::PlaylistCreated(p) => push(
            &streams.playlists,
            to_value(&PlaylistRow::new(p, RowOperation::Insert, now_ms)),
        ),
        SpotifyEvent::PlaylistModified(p) => push(
            &streams.playlists,
            to_value(&PlaylistRow::new(p, RowOperation::Update, now_ms)),
        ),
        SpotifyEvent::PlaylistDeleted(p) => push(
            &streams.playlists,
            to_value(&PlaylistRow::new(p, RowOperation::Delete, now_ms)),
        ),
    }
    rows
}

/// Unconfigured streams are skipped; rows that failed to serialize are logged.
fn push_row(rows: &mut Vec<(String, Value)>, stream: &Option<String>, row: Result<Value>) {
    let Some(stream) = stream else {
        return;
    };
    match row {
        Ok(row) => rows.push((stream.clone(), row)),
        Err(e) => warn!(stream = %stream, error = %e, "Dropping ingest row"),
    }
}

fn to_value<T: Serialize>(row: &T) -> Result<Value> {
    serde_json::to_value(row).map_err(|e| crate::error::SyncError::decode("ingest row", e))
}

pub struct Ingestor {
    sink: Arc<dyn RecordSink>,
    streams: IngestStreams,
}

impl Ingestor {
    pub fn new(sink: Arc<dyn RecordSink>, streams: IngestStreams) -> Self {
        Self { sink, streams }
    }

    pub async fn handle(&self, event: &SpotifyEvent) {
        let now_ms = Utc::now().timestamp_millis();
        for (stream, row) in rows_for(event, &self.streams, now_ms) {
            debug!(stream = %stream, event = event.name(), "Writing ingest row");
            if let Err(e) = self.sink.push_records(&stream, vec![row]).await {
                warn!(stream = %stream, error = %e, "Failed to write ingest row");
            }
        }
    }

    /// Consume events until the sending side is dropped.
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<SpotifyEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(&event).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testing::{features, now_playing, playlist, RecordingSink};
    use serde_json::json;

    fn all_streams() -> IngestStreams {
        IngestStreams {
            now_playing: Some("now".to_string()),
            tracks: Some("tracks".to_string()),
            track_features: Some("features".to_string()),
            playlists: Some("playlists".to_string()),
        }
    }

    #[test]
    fn test_track_changed_produces_three_rows() {
        let event = SpotifyEvent::TrackChanged(Box::new(TrackInformation {
            id: "t1".to_string(),
            currently_playing: now_playing("t1", true),
            analysis: json!({}),
            features: features("t1"),
        }));

        let rows = rows_for(&event, &all_streams(), 42);
        let streams: Vec<&str> = rows.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(streams, vec!["now", "tracks", "features"]);
        assert_eq!(rows[0].1["track_id"], "t1");
        assert_eq!(rows[0].1["type"], "track");
        assert_eq!(rows[2].1["danceability"], 0.5);
        assert_eq!(rows[2].1["isDeleted"], false);
    }

    #[test]
    fn test_playlist_deleted_row() {
        let event = SpotifyEvent::PlaylistDeleted(playlist("P1", "A", 4));
        let rows = rows_for(&event, &all_streams(), 7);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1["operation"], "DELETE");
        assert_eq!(rows[0].1["isDeleted"], true);
        assert_eq!(rows[0].1["tracks_total"], 4);
    }

    #[test]
    fn test_unconfigured_stream_is_skipped() {
        let event = SpotifyEvent::PlaylistCreated(playlist("P1", "A", 4));
        assert!(rows_for(&event, &IngestStreams::default(), 7).is_empty());
        assert!(rows_for(&SpotifyEvent::IsPlaying(true), &all_streams(), 7).is_empty());
    }

    #[test]
    fn test_unserializable_row_is_dropped() {
        let mut rows = Vec::new();
        let stream = Some("now".to_string());
        push_row(&mut rows, &stream, Err(SyncError::decode("ingest row", "bad")));
        push_row(&mut rows, &stream, Ok(json!({"ok": true})));
        push_row(&mut rows, &None, Ok(json!({"ok": false})));

        assert_eq!(rows, vec![("now".to_string(), json!({"ok": true}))]);
    }

    #[tokio::test]
    async fn test_ingestor_writes_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let ingestor = Ingestor::new(sink.clone(), all_streams());

        ingestor
            .handle(&SpotifyEvent::PlaylistModified(playlist("P1", "B", 2)))
            .await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "playlists");
        assert_eq!(records[0].1["operation"], "UPDATE");
    }
}
