//! Playback settings persistence
//!
//! Every tuned constant of the playback core lives here as a named field so
//! it can be adjusted from the settings file instead of being baked in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Remote server endpoints
    #[serde(default)]
    pub server: ServerSettings,
    /// Media backend adapter behaviour
    #[serde(default)]
    pub engine: EngineSettings,
    /// Stall watchdog thresholds
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    /// Seek policy
    #[serde(default)]
    pub seek: SeekSettings,
    /// OS now-playing bridge
    #[serde(default)]
    pub bridge: BridgeSettings,
    /// Resume offset persistence
    #[serde(default)]
    pub resume: ResumeSettings,
}

/// Remote server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the media server, without trailing slash
    pub base_url: String,
    /// Timeout for cache-status and metadata requests
    #[serde(with = "millis", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4533".to_string(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Media backend adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Delay into playback before the next item is prefetched
    #[serde(with = "millis")]
    pub preload_delay: Duration,
    /// Time a silenced handle is kept before release on source swap
    #[serde(with = "millis")]
    pub anti_click_delay: Duration,
    /// A load with no outcome after this long is a load error
    #[serde(with = "millis")]
    pub load_timeout: Duration,
    /// Initial volume (0.0 - 1.0)
    pub volume: f32,
    /// Audio output device name, `None` for the default device
    pub output_device: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            preload_delay: Duration::from_secs(2),
            anti_click_delay: Duration::from_millis(50),
            load_timeout: Duration::from_secs(30),
            volume: 1.0,
            output_device: None,
        }
    }
}

/// Heartbeat watchdog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// No progress for this long while playing enters BUFFERING
    #[serde(with = "millis")]
    pub stall_threshold: Duration,
    /// Staying in BUFFERING this long is a lost connection
    #[serde(with = "millis")]
    pub buffer_timeout: Duration,
    /// Interval of the watchdog tick when no time samples arrive
    #[serde(with = "millis")]
    pub tick_interval: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            stall_threshold: Duration::from_secs(4),
            buffer_timeout: Duration::from_secs(20),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Seek coordinator settings
///
/// `large_skip_threshold` and `verify_tolerance` are empirically tuned.
/// Raising the tolerance trades missed failed seeks for fewer reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekSettings {
    /// Deltas at or above this run immediately, below are debounced
    #[serde(with = "millis")]
    pub large_skip_threshold: Duration,
    /// Debounce window for fine scrubs
    #[serde(with = "millis")]
    pub scrub_debounce: Duration,
    /// Maximum distance between target and landed position
    #[serde(with = "millis")]
    pub verify_tolerance: Duration,
    /// Verification delay when the episode is cached
    #[serde(with = "millis")]
    pub cached_verify_delay: Duration,
    /// Verification delay for a best-effort seek into uncached media
    #[serde(with = "millis")]
    pub uncached_verify_delay: Duration,
    /// Interval between cache-status polls
    #[serde(with = "millis")]
    pub cache_poll_interval: Duration,
    /// Poll attempts before giving up
    pub cache_poll_max_attempts: u32,
    /// How long a direct seek suppresses same-media reconciliation
    #[serde(with = "millis")]
    pub guard_window: Duration,
}

impl Default for SeekSettings {
    fn default() -> Self {
        Self {
            large_skip_threshold: Duration::from_secs(10),
            scrub_debounce: Duration::from_millis(150),
            verify_tolerance: Duration::from_secs(5),
            cached_verify_delay: Duration::from_millis(150),
            uncached_verify_delay: Duration::from_millis(1500),
            cache_poll_interval: Duration::from_secs(2),
            cache_poll_max_attempts: 30,
            guard_window: Duration::from_millis(500),
        }
    }
}

/// Now-playing bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Minimum interval between position reports to the OS
    #[serde(with = "millis")]
    pub position_report_interval: Duration,
    /// Identical consecutive actions inside this window are dropped
    #[serde(with = "millis")]
    pub action_dedup_window: Duration,
    /// Skip interval exposed for audiobooks and podcasts
    #[serde(with = "millis")]
    pub long_form_skip: Duration,
    /// Name shown by the OS media surface
    pub display_name: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            position_report_interval: Duration::from_secs(5),
            action_dedup_window: Duration::from_millis(300),
            long_form_skip: Duration::from_secs(30),
            display_name: "Nocturne".to_string(),
        }
    }
}

/// Resume offset settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeSettings {
    /// How often the position of long-form media is written back
    #[serde(with = "millis")]
    pub persist_interval: Duration,
    /// Offsets this close to the start are not worth resuming from
    #[serde(with = "millis")]
    pub min_offset: Duration,
    /// Database file, `None` for the platform data dir
    pub database_path: Option<PathBuf>,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(15),
            min_offset: Duration::from_secs(5),
            database_path: None,
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn file_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("settings.json"))
    }

    /// Default location of the resume database
    pub fn default_database_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().join("playback.db"))
    }

    /// Load settings from file, or return defaults if not found
    pub fn load() -> Self {
        Self::file_path()
            .and_then(|path| match Self::load_from_file(&path) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    tracing::warn!("Using default settings ({:?}): {}", path, e);
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Load settings from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Save settings to a specific file
    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| SettingsError::Io(e.to_string()))?;
        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "nocturne", "Nocturne")
}

/// Errors that can occur with settings
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Durations are stored as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let json = r#"{ "seek": { "large_skip_threshold": 15000 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.seek.large_skip_threshold, Duration::from_secs(15));
        assert_eq!(settings.seek.verify_tolerance, Duration::from_secs(5));
        assert_eq!(settings.heartbeat.stall_threshold, Duration::from_secs(4));
        assert_eq!(settings.bridge.action_dedup_window, Duration::from_millis(300));
    }

    #[test]
    fn save_and_reload() {
        let dir = std::env::temp_dir().join(format!("nocturne-settings-{}", std::process::id()));
        let path = dir.join("settings.json");

        let mut settings = Settings::default();
        settings.server.base_url = "https://media.example".to_string();
        settings.bridge.long_form_skip = Duration::from_secs(15);
        settings.save_to_file(&path).unwrap();

        let loaded = Settings::load_from_file(&path).unwrap();
        assert_eq!(loaded.server.base_url, "https://media.example");
        assert_eq!(loaded.bridge.long_form_skip, Duration::from_secs(15));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Settings::load_from_file(Path::new("/nonexistent/nocturne.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
