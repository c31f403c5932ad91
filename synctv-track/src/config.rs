//! Outgoing track configuration

use crate::error::Result;
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Outgoing track configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Whether newly created tracks start muted
    pub start_muted: bool,
    /// Length of the sliding window used for instantaneous bitrate (ms)
    pub bitrate_window_ms: u64,
    /// Maximum number of samples kept per bitrate window
    pub max_window_samples: usize,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            start_muted: false,
            bitrate_window_ms: 1000,
            max_window_samples: 1000,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl TrackConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SYNCTV_TRACK_START_MUTED, SYNCTV_TRACK_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_TRACK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Bitrate window as a `Duration`, never shorter than one millisecond
    #[must_use]
    pub fn bitrate_window(&self) -> Duration {
        Duration::from_millis(self.bitrate_window_ms.max(1))
    }
}
