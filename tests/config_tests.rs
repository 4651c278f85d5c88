//! Loading configuration files from disk.

use std::fs;

use playsync::Config;
use tempfile::TempDir;

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_file(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.sync.playlist_interval_ms, 5000);
    assert!(config.ingest.enabled);
}

#[test]
fn test_file_values_are_loaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[spotify]
client_id = "id"
client_secret = "secret"
refresh_token = "refresh"

[platform]
url = "https://platform.example"
token = "token"
ontology = "ontology-rid"
track_object_type = "PlaylistMembership"

[platform.actions]
delete_playlist = "remove-playlist"

[platform.streams]
now_playing = "now-playing"

[sync]
flush_interval_ms = 250

[ingest]
enabled = false
"#,
    )
    .unwrap();

    let config = Config::load_file(&path).unwrap();

    assert!(config.validate().is_ok());
    assert_eq!(config.platform.track_object_type, "PlaylistMembership");
    assert_eq!(config.platform.playlist_object_type, "SpotifyPlaylist");
    assert_eq!(config.platform.actions.delete_playlist, "remove-playlist");
    assert_eq!(config.platform.actions.modify_playlist, "modify-spotify-playlist");
    assert_eq!(config.platform.streams.now_playing.as_deref(), Some("now-playing"));
    assert_eq!(config.platform.streams.playlists, None);
    assert_eq!(config.sync.flush_interval_ms, 250);
    assert!(!config.ingest.enabled);
}

#[test]
fn test_invalid_file_is_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "this is not valid [[ toml").unwrap();

    let err = Config::load_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}
