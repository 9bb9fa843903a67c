//! Configuration file support for mcpflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MCPFLASH_*)
//! 3. Local config file (./mcpflash.toml)
//! 4. Global config file (~/.config/mcpflash/config.toml)
//!
//! `--config PATH` replaces sources 3 and 4 with a single file.

use directories::ProjectDirs;
use log::{debug, warn};
use mcpflash::Timing;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "mcpflash.toml";

/// A configuration file that could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// File that was requested.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Exchange timing overrides. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// Wait after ReadVersion/ReadCrc before reading, in milliseconds.
    pub settle_ms: Option<u64>,
    /// Wait after EraseFlash before reading, in milliseconds.
    pub erase_settle_ms: Option<u64>,
    /// Extra polling time for a late response, in milliseconds.
    pub poll_window_ms: Option<u64>,
    /// Interval between polls, in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Idle bound on a ProgramFlash acknowledgment, in milliseconds.
    pub ack_timeout_ms: Option<u64>,
    /// Byte bound on a ProgramFlash acknowledgment.
    pub max_ack_len: Option<usize>,
}

impl TimingConfig {
    /// Apply the configured overrides on top of `base`.
    pub fn apply(&self, base: Timing) -> Timing {
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);

        Timing {
            settle_delay: ms(self.settle_ms, base.settle_delay),
            erase_settle_delay: ms(self.erase_settle_ms, base.erase_settle_delay),
            poll_window: ms(self.poll_window_ms, base.poll_window),
            poll_interval: ms(self.poll_interval_ms, base.poll_interval),
            ack_timeout: ms(self.ack_timeout_ms, base.ack_timeout),
            max_ack_len: self.max_ack_len.unwrap_or(base.max_ack_len),
        }
    }

    fn merge(&mut self, other: Self) {
        self.settle_ms = other.settle_ms.or(self.settle_ms);
        self.erase_settle_ms = other.erase_settle_ms.or(self.erase_settle_ms);
        self.poll_window_ms = other.poll_window_ms.or(self.poll_window_ms);
        self.poll_interval_ms = other.poll_interval_ms.or(self.poll_interval_ms);
        self.ack_timeout_ms = other.ack_timeout_ms.or(self.ack_timeout_ms);
        self.max_ack_len = other.max_ack_len.or(self.max_ack_len);
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Timing overrides.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Files that cannot be read or parsed are skipped with a warning.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_optional(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_optional(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_optional(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match Self::load_from_path(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("{e}");
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mcpflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        self.timing.merge(other.timing);
    }
}
