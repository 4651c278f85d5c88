use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batcher::NameFilter;
use crate::ingest::IngestStreams;
use crate::service::spotify::{DEFAULT_ACCOUNTS_URL, DEFAULT_API_URL};
use crate::subscription::SubscriptionOptions;
use crate::writers::PlatformActions;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spotify: SpotifyConfig,
    pub platform: PlatformConfig,
    pub sync: SyncConfig,
    pub ingest: IngestConfig,
}

/// Streaming service credentials and endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub api_url: String,
    pub accounts_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Optional; refreshed on first use either way
    pub access_token: String,
    pub refresh_token: String,
    pub scope: String,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            accounts_url: DEFAULT_ACCOUNTS_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            scope: "user-read-currently-playing playlist-read-private user-top-read playlist-modify-private"
                .to_string(),
        }
    }
}

/// Ontology platform connection, object types and action names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub url: String,
    pub token: String,
    pub ontology: String,
    pub playlist_object_type: String,
    pub track_object_type: String,
    pub actions: PlatformActions,
    pub streams: IngestStreams,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            ontology: String::new(),
            playlist_object_type: "SpotifyPlaylist".to_string(),
            track_object_type: "SpotifyPlaylistTrack".to_string(),
            actions: PlatformActions::default(),
            streams: IngestStreams::default(),
        }
    }
}

/// Timer periods and the playlist name gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub playback_interval_ms: u64,
    pub playlist_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub subscription_refresh_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub name_filter: NameFilter,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            playback_interval_ms: 1_000,
            playlist_interval_ms: 5_000,
            flush_interval_ms: 1_000,
            subscription_refresh_ms: 120_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            name_filter: NameFilter::default(),
        }
    }
}

impl SyncConfig {
    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(self.playback_interval_ms)
    }

    pub fn playlist_interval(&self) -> Duration {
        Duration::from_millis(self.playlist_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            refresh_interval: Duration::from_millis(self.subscription_refresh_ms),
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

/// Now-playing ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("playsync");

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load from `path` (or the default location) and apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        let mut config = Self::load_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply overrides from `lookup`, usually the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };

        set(&mut self.spotify.api_url, "SPOTIFY_API_URL");
        set(&mut self.spotify.accounts_url, "SPOTIFY_ACCOUNTS_URL");
        set(&mut self.spotify.client_id, "SPOTIFY_CLIENT_ID");
        set(&mut self.spotify.client_secret, "SPOTIFY_CLIENT_SECRET");
        set(&mut self.spotify.access_token, "SPOTIFY_ACCESS_TOKEN");
        set(&mut self.spotify.refresh_token, "SPOTIFY_REFRESH_TOKEN");
        set(&mut self.platform.url, "PLATFORM_URL");
        set(&mut self.platform.token, "PLATFORM_TOKEN");
        set(&mut self.platform.ontology, "PLATFORM_ONTOLOGY");

        if let Some(ms) = lookup("PLAYLIST_POLL_INTERVAL_MS").and_then(|v| v.trim().parse().ok()) {
            self.sync.playlist_interval_ms = ms;
        }
    }

    /// Reject configurations that cannot run before anything starts.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("spotify.client_id", &self.spotify.client_id),
            ("spotify.client_secret", &self.spotify.client_secret),
            ("spotify.refresh_token", &self.spotify.refresh_token),
            ("platform.url", &self.platform.url),
            ("platform.token", &self.platform.token),
            ("platform.ontology", &self.platform.ontology),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            bail!("Missing required configuration: {}", missing.join(", "));
        }

        let intervals = [
            ("sync.playback_interval_ms", self.sync.playback_interval_ms),
            ("sync.playlist_interval_ms", self.sync.playlist_interval_ms),
            ("sync.flush_interval_ms", self.sync.flush_interval_ms),
            ("sync.subscription_refresh_ms", self.sync.subscription_refresh_ms),
            ("sync.reconnect_base_ms", self.sync.reconnect_base_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            bail!("{name} must be greater than zero");
        }
        if self.sync.reconnect_max_ms < self.sync.reconnect_base_ms {
            bail!("sync.reconnect_max_ms must not be below sync.reconnect_base_ms");
        }
        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> Config {
        let mut config = Config::default();
        config.spotify.client_id = "id".to_string();
        config.spotify.client_secret = "secret".to_string();
        config.spotify.refresh_token = "refresh".to_string();
        config.platform.url = "https://platform.example".to_string();
        config.platform.token = "token".to_string();
        config.platform.ontology = "ontology".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.spotify.api_url, "https://api.spotify.com/v1");
        assert_eq!(config.sync.playback_interval_ms, 1000);
        assert_eq!(config.sync.playlist_interval_ms, 5000);
        assert_eq!(config.sync.flush_interval_ms, 1000);
        assert_eq!(config.sync.subscription_refresh_ms, 120_000);
        assert_eq!(config.sync.reconnect_base_ms, 1000);
        assert_eq!(config.sync.reconnect_max_ms, 30_000);
        assert!(config.sync.name_filter.is_empty());
        assert_eq!(config.platform.playlist_object_type, "SpotifyPlaylist");
        assert!(config.ingest.enabled);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[sync]
playlist_interval_ms = 10000

[sync.name_filter]
prefix = "[shared]"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.sync.playlist_interval_ms, 10_000);
        assert_eq!(config.sync.flush_interval_ms, 1000);
        assert_eq!(config.sync.name_filter.prefix.as_deref(), Some("[shared]"));
        assert_eq!(config.sync.name_filter.contains, None);
        assert_eq!(config.platform.actions, PlatformActions::default());
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Result<Config, _> = toml::from_str(&example);
        assert!(parsed.is_ok(), "Example config should be valid TOML");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SPOTIFY_CLIENT_ID", "env-id"),
            ("PLATFORM_URL", "https://env.example"),
            ("PLAYLIST_POLL_INTERVAL_MS", "2500"),
            ("SPOTIFY_REFRESH_TOKEN", ""),
        ]
        .into_iter()
        .collect();
        let mut config = valid();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.spotify.client_id, "env-id");
        assert_eq!(config.platform.url, "https://env.example");
        assert_eq!(config.sync.playlist_interval_ms, 2500);
        // Empty values do not clobber the file.
        assert_eq!(config.spotify.refresh_token, "refresh");
    }

    #[test]
    fn test_validate_lists_missing_fields() {
        assert!(valid().validate().is_ok());

        let err = Config::default().validate().unwrap_err().to_string();
        assert!(err.contains("spotify.client_id"));
        assert!(err.contains("platform.ontology"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = valid();
        config.sync.flush_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.sync.reconnect_max_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subscription_options_from_sync() {
        let options = SyncConfig::default().subscription_options();
        assert_eq!(options, SubscriptionOptions::default());
    }
}
