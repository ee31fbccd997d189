//! Configuration settings and validation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default marker string counted in file contents.
pub const DEFAULT_MARKER: &str = "There you are!!";

/// Default scan interval, also used as the aggregation window.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How content scans are attributed to task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolicy {
    /// Scans join the active run like additions and deletions do.
    #[default]
    Join,
    /// Every scan opens and finalizes a run of its own, superseding any
    /// run still in progress.
    Fresh,
}

impl ScanPolicy {
    /// Policy name as used on the command line and in JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Fresh => "fresh",
        }
    }
}

/// Watch settings consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    /// Directory tree to observe.
    pub directory: PathBuf,
    /// Marker string counted (case-insensitively) in file contents.
    pub marker: String,
    /// Scan interval hint. Runs opened less than this long ago are
    /// rejoined by subsequent activity.
    pub scan_interval: Duration,
    /// Attribution policy for content scans.
    pub scan_policy: ScanPolicy,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./watched"),
            marker: DEFAULT_MARKER.to_string(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            scan_policy: ScanPolicy::default(),
        }
    }
}

impl WatchSettings {
    /// Validate watch settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or marker is empty.
    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(Error::config("directory cannot be empty"));
        }

        if self.marker.is_empty() {
            return Err(Error::config("marker string cannot be empty"));
        }

        Ok(())
    }
}

/// Watch settings shared between the engine and the control API.
pub type SharedSettings = Arc<RwLock<WatchSettings>>;

/// Main configuration for the Dirwatch server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the `SQLite` database.
    pub data_dir: PathBuf,

    /// Host address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Settings for the watch engine.
    pub watch: WatchSettings,

    /// Start the engine when the server boots.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            watch: WatchSettings::default(),
            autostart: true,
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("port cannot be 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.host.is_empty() {
            return Err(Error::config("host cannot be empty"));
        }

        self.watch.validate()
    }

    /// Get the path to the `SQLite` database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("dirwatch.db")
    }

    /// Get the server address as a string.
    #[must_use]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Wrap the watch settings for sharing with the engine and API.
    #[must_use]
    pub fn shared_settings(&self) -> SharedSettings {
        Arc::new(RwLock::new(self.watch.clone()))
    }
}
