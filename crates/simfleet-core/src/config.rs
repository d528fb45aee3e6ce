//! Persistent configuration for simfleet.
//!
//! Stores fleet settings in `~/.simfleet/config.json`: the hosts devices live
//! on, where backups and recordings are kept on those hosts, where capture
//! output lands locally, and the timeouts used by backups, commands and the
//! autorelease scheduler. Every field has a default, so a partial file (or
//! `{}`) is valid.
//!
//! # Example
//!
//! ```no_run
//! use simfleet_core::config::FleetConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = FleetConfig::load();
//!
//! for (name, host) in &config.hosts {
//!     println!("{name}: {host}");
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::autorelease::AutoreleaseConfig;
use crate::host::Host;

const CONFIG_FILENAME: &str = "config.json";

/// Errors from loading or saving the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown host '{0}'")]
    UnknownHost(String),
}

/// Returns the simfleet state directory, `~/.simfleet`.
///
/// Falls back to the system temp directory when no home directory is known.
pub fn fleet_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".simfleet")
}

/// Persistent simfleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Named device hosts. Commands pick one with `--host <name>`.
    #[serde(default)]
    pub hosts: BTreeMap<String, Host>,

    /// Directory on each device host holding per-device backups.
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Directory on each device host receiving screen recordings.
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    /// Local directory receiving capture output files.
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,

    #[serde(default = "default_backup_timeout_secs")]
    pub backup_timeout_secs: u64,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub autorelease: AutoreleaseSettings,
}

/// `autorelease` section of the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoreleaseSettings {
    #[serde(default = "default_release_timeout_secs")]
    pub release_timeout_secs: u64,

    #[serde(default = "default_min_sleep_secs")]
    pub min_sleep_secs: u64,
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/tmp/simfleet/backups")
}

fn default_video_dir() -> PathBuf {
    PathBuf::from("/tmp/simfleet/videos")
}

fn default_capture_dir() -> PathBuf {
    fleet_dir().join("captures")
}

fn default_backup_timeout_secs() -> u64 {
    120
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_release_timeout_secs() -> u64 {
    120
}

fn default_min_sleep_secs() -> u64 {
    1
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            hosts: BTreeMap::new(),
            backup_root: default_backup_root(),
            video_dir: default_video_dir(),
            capture_dir: default_capture_dir(),
            backup_timeout_secs: default_backup_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            autorelease: AutoreleaseSettings::default(),
        }
    }
}

impl Default for AutoreleaseSettings {
    fn default() -> Self {
        Self {
            release_timeout_secs: default_release_timeout_secs(),
            min_sleep_secs: default_min_sleep_secs(),
        }
    }
}

impl AutoreleaseSettings {
    /// Scheduler settings. A zero minimum sleep is raised to one second.
    pub fn scheduler_config(&self) -> AutoreleaseConfig {
        AutoreleaseConfig {
            release_timeout: Duration::from_secs(self.release_timeout_secs),
            min_sleep: Duration::from_secs(self.min_sleep_secs.max(1)),
        }
    }
}

impl FleetConfig {
    /// Default location, `~/.simfleet/config.json`.
    pub fn default_path() -> PathBuf {
        fleet_dir().join(CONFIG_FILENAME)
    }

    /// Load config from `~/.simfleet/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        match Self::load_from(&Self::default_path()) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable config");
                Self::default()
            }
        }
    }

    /// Loads config from `path`, reporting missing or malformed files.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to `~/.simfleet/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path())
    }

    /// Saves config as pretty JSON, creating the parent directory.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    /// Looks up a host by name. `None` means this machine.
    pub fn host(&self, name: Option<&str>) -> Result<Host, ConfigError> {
        match name {
            None => Ok(Host::local()),
            Some(name) => self
                .hosts
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownHost(name.to_string())),
        }
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
