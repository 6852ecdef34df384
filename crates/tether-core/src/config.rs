//! Persistent host configuration for tether.
//!
//! Stores named device profiles and default timings in
//! `~/.tether/config.json`.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::config::TetherConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = TetherConfig::load();
//!
//! if let Some(profile) = config.devices.get("living-room") {
//!     println!("living-room: {}", profile.address());
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::DEFAULT_PORT;
use crate::envelope::LogLevel;

const CONFIG_FILENAME: &str = "config.json";

/// Default overall request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default submission retry interval in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Returns the tether directory path (`~/.tether/`), creating it if needed.
///
/// Falls back to the current directory when no home directory is known.
pub fn tether_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether");
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// Connection and timing settings for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides the global default timeout for this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    /// Scales every timeout for slow devices or networks.
    #[serde(default = "default_multiplier")]
    pub timeout_multiplier: f64,
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_multiplier() -> f64 {
    1.0
}

impl DeviceProfile {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            default_timeout_ms: None,
            timeout_multiplier: default_multiplier(),
            log_level: LogLevel::default(),
        }
    }

    /// `host:port` of the device listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Persistent tether configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceProfile>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            devices: BTreeMap::new(),
        }
    }
}

impl TetherConfig {
    /// Path of the config file.
    pub fn path() -> PathBuf {
        tether_dir().join(CONFIG_FILENAME)
    }

    /// Load config from `~/.tether/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&Self::path()).unwrap_or_default()
    }

    /// Load config from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to `~/.tether/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TetherConfig::default();
        assert_eq!(config.default_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry_interval(), Duration::from_millis(300));
        assert!(config.devices.is_empty());
    }

    #[test]
    fn deserialize_empty_json() {
        let loaded: TetherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, TetherConfig::default());
    }

    #[test]
    fn zero_retry_interval_is_raised_to_one_ms() {
        let loaded: TetherConfig = serde_json::from_str(r#"{"retry_interval_ms": 0}"#).unwrap();
        assert_eq!(loaded.retry_interval(), Duration::from_millis(1));
    }

    #[test]
    fn profile_defaults_fill_in() {
        let profile: DeviceProfile = serde_json::from_str(r#"{"host": "10.0.0.5"}"#).unwrap();
        assert_eq!(profile.port, DEFAULT_PORT);
        assert_eq!(profile.timeout_multiplier, 1.0);
        assert_eq!(profile.log_level, LogLevel::Info);
        assert_eq!(profile.address(), "10.0.0.5:9000");
        assert_eq!(profile.default_timeout(), None);
    }

    #[test]
    fn save_and_load_from_path() {
        let path = std::env::temp_dir().join(format!("tether-config-{}.json", uuid::Uuid::new_v4()));
        let mut config = TetherConfig::default();
        let mut profile = DeviceProfile::new("box.local");
        profile.timeout_multiplier = 2.5;
        profile.default_timeout_ms = Some(4000);
        config.devices.insert("box".into(), profile);

        config.save_to(&path).unwrap();
        let loaded = TetherConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_from_reports_errors() {
        let missing = std::env::temp_dir().join("tether-definitely-missing.json");
        assert!(matches!(
            TetherConfig::load_from(&missing),
            Err(ConfigError::Read { .. })
        ));

        let path = std::env::temp_dir().join(format!("tether-bad-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "not json").unwrap();
        let result = TetherConfig::load_from(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
