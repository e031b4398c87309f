//! Receiver Configuration
//!
//! Two layers: [`ReceiverConfig`] is the full static configuration handed to
//! the receiver at start; [`ReceiverSettings`] is the subset that may change
//! while streaming (timeouts, reporting interval, feedback flag) and is
//! delivered through a `tokio::sync::watch` channel so the streaming loop
//! can pick up changes without restarting the attempt.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which replication slot, if any, the receiver asks the primary to use.
/// At most one of a named slot and an ephemeral slot makes sense, so this
/// is a tagged choice rather than two nullable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplicationSlot {
    /// Use a pre-created slot with this name.
    Named(String),
    /// Create a temporary slot for the lifetime of the connection.
    Ephemeral,
    /// Stream without a slot.
    #[default]
    None,
}

/// Disposition of completed segments with respect to archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ArchiveMode {
    /// No archiver is running; completed segments are marked done so a
    /// later-enabled archiver does not pick up streamed segments.
    #[default]
    Off,
    /// An archiver runs on the original log source only; streamed copies
    /// are marked done to avoid archiving the same segment twice.
    On,
    /// Capture everything: completed streamed segments are marked ready
    /// for archive.
    Always,
}

/// Runtime-adjustable receiver settings.
///
/// A zero duration disables the corresponding behavior, matching the
/// "interval <= 0 means never" convention of the original system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSettings {
    /// End the streaming attempt after this much silence from the primary.
    /// Zero disables the silence timeout (and the half-interval ping).
    #[serde(with = "duration_millis")]
    pub receiver_timeout: Duration,
    /// How often to report write/flush progress to the primary.
    /// Zero disables unforced status replies and feedback.
    #[serde(with = "duration_millis")]
    pub status_interval: Duration,
    /// Advise the primary of the oldest transaction id standby queries
    /// still need.
    pub hot_standby_feedback: bool,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        ReceiverSettings {
            receiver_timeout: Duration::from_secs(60),
            status_interval: Duration::from_secs(10),
            hot_standby_feedback: false,
        }
    }
}

/// Full receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Directory receiving the segment files.
    pub wal_dir: PathBuf,
    /// Fixed segment size in bytes. Positions map to (segment, offset)
    /// relative to this.
    pub segment_size: u64,
    /// Archival disposition for completed segments.
    pub archive_mode: ArchiveMode,
    /// Name reported to the primary when connecting.
    pub cluster_name: String,
    /// Runtime-adjustable settings (initial values).
    pub settings: ReceiverSettings,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            wal_dir: PathBuf::from("/var/lib/walrecv/wal"),
            segment_size: 16 * 1024 * 1024, // 16MiB
            archive_mode: ArchiveMode::Off,
            cluster_name: "walrecv".to_string(),
            settings: ReceiverSettings::default(),
        }
    }
}

impl ReceiverConfig {
    /// Configuration for testing (tiny segments, fast intervals).
    pub fn test() -> Self {
        ReceiverConfig {
            wal_dir: PathBuf::from("/tmp/walrecv-test"),
            segment_size: 64 * 1024, // 64KB for fast rotation in tests
            archive_mode: ArchiveMode::Off,
            cluster_name: "walrecv-test".to_string(),
            settings: ReceiverSettings {
                receiver_timeout: Duration::from_millis(500),
                status_interval: Duration::from_millis(100),
                hot_standby_feedback: false,
            },
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Error loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "could not read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "could not parse config {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReceiverConfig::default();
        assert_eq!(config.segment_size, 16 * 1024 * 1024);
        assert_eq!(config.archive_mode, ArchiveMode::Off);
        assert_eq!(config.settings.receiver_timeout, Duration::from_secs(60));
        assert!(!config.settings.hot_standby_feedback);
    }

    #[test]
    fn test_slot_default_is_none() {
        assert_eq!(ReplicationSlot::default(), ReplicationSlot::None);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = ReceiverConfig::test();
        let text = toml::to_string(&config).unwrap();
        let parsed: ReceiverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.segment_size, config.segment_size);
        assert_eq!(parsed.settings, config.settings);
        assert_eq!(parsed.cluster_name, config.cluster_name);
    }

    #[test]
    fn test_duration_serialized_as_millis() {
        let settings = ReceiverSettings {
            receiver_timeout: Duration::from_secs(2),
            status_interval: Duration::from_millis(250),
            hot_standby_feedback: true,
        };
        let text = toml::to_string(&settings).unwrap();
        assert!(text.contains("receiver_timeout = 2000"), "got: {}", text);
        assert!(text.contains("status_interval = 250"), "got: {}", text);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ReceiverConfig::load(Path::new("/nonexistent/walrecv.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
