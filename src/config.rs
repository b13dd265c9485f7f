// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration loading.
//!
//! Configuration is read from `<config dir>/podplay/config.toml`. A missing
//! file yields the defaults; missing fields in an existing file fall back to
//! their defaults as well.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const APP_DIR: &str = "podplay";

/// Main configuration struct
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub downloads: DownloadConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds the library file and the downloads directory
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR));
        Self { data_dir }
    }
}

impl StorageConfig {
    pub fn library_path(&self) -> PathBuf {
        self.data_dir.join("library.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Seed for the per-podcast "keep N downloaded" setting
    pub keep_per_podcast: u16,
    pub max_concurrent_refreshes: usize,
    /// Fixed extension of every stored audio file
    pub audio_extension: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            keep_per_podcast: 3,
            max_concurrent_refreshes: 4,
            audio_extension: "mp3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Minimum time between two position checkpoints
    pub save_frequency_secs: u64,
    pub tick_interval_ms: u64,
    /// Remaining time below which an episode counts as finished
    pub end_epsilon_secs: f64,
    pub skip_forward_secs: f64,
    pub skip_backward_secs: f64,
    pub default_rate: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            save_frequency_secs: 5,
            tick_interval_ms: 500,
            end_epsilon_secs: 0.5,
            skip_forward_secs: 30.0,
            skip_backward_secs: 30.0,
            default_rate: 1.0,
        }
    }
}

impl PlaybackConfig {
    pub fn save_frequency(&self) -> Duration {
        Duration::from_secs(self.save_frequency_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        // A zero period would make the tokio interval panic
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// `<config dir>/podplay/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_DIR).join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();

        assert_eq!(config.downloads.keep_per_podcast, 3);
        assert_eq!(config.downloads.audio_extension, "mp3");
        assert_eq!(config.playback.save_frequency_secs, 5);
        assert_eq!(config.playback.tick_interval(), Duration::from_millis(500));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
data_dir = "/tmp/podplay-test"

[playback]
save_frequency_secs = 10
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/podplay-test"));
        assert_eq!(
            config.storage.downloads_dir(),
            PathBuf::from("/tmp/podplay-test/downloads")
        );
        assert_eq!(config.playback.save_frequency(), Duration::from_secs(10));
        assert_eq!(config.playback.skip_forward_secs, 30.0);
        assert_eq!(config.downloads.max_concurrent_refreshes, 4);
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[playback\nsave_frequency_secs = ").unwrap();

        let result = Config::load_from(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn zero_tick_interval_is_clamped() {
        let config = PlaybackConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
    }
}
