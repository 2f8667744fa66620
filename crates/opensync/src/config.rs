//! Configuration management for opensync.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::LogNamePattern;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "opensync";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "ledger.db";

/// Default status file name.
const STATUS_FILE_NAME: &str = "status.json";

/// Where the storage card's log directory is mounted by default.
const DEFAULT_WATCH_DIR: &str = "/mnt/sdcard/data_log";

/// Environment variable prefix. Nested keys are separated by `__`,
/// e.g. `OPENSYNC_POWER__DRAIN_DEADLINE_MS=8000`.
const ENV_PREFIX: &str = "OPENSYNC_";

/// Longest allowed power poll interval.
const MAX_POLL_INTERVAL_MS: u64 = 1_000;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `OPENSYNC_`)
/// 2. TOML config file at `~/.config/opensync/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GPIO wiring.
    pub gpio: GpioConfig,
    /// Power sequencing.
    pub power: PowerConfig,
    /// Flight log sync.
    pub sync: SyncConfig,
    /// Transfer ledger.
    pub storage: StorageConfig,
    /// Daemon behaviour.
    pub daemon: DaemonConfig,
}

/// Which GPIO facility to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpioBackend {
    /// Linux sysfs GPIO.
    #[default]
    Sysfs,
    /// In-memory lines; power events injected with SIGUSR1/SIGUSR2.
    Simulated,
}

impl std::fmt::Display for GpioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sysfs => write!(f, "sysfs"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// GPIO wiring. Defaults match the UPS HAT reference wiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// GPIO facility.
    pub backend: GpioBackend,
    /// Root of the sysfs GPIO tree.
    pub sysfs_root: PathBuf,
    /// Utility power fault input.
    pub power_fault_pin: u32,
    /// UPS online input.
    pub ups_online_pin: u32,
    /// Host-alive heartbeat output.
    pub heartbeat_pin: u32,
}

/// Power sequencing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Input sampling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive identical samples needed to confirm a status change.
    pub debounce_samples: u32,
    /// How long the sync pipeline gets to drain before the heartbeat is released.
    pub drain_deadline_ms: u64,
    /// How long to watch the UPS-online line at startup. 0 skips the probe.
    pub ups_probe_ms: u64,
}

/// Flight log sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the sync pipeline.
    pub enabled: bool,
    /// Directory the storage card is mounted at.
    /// Defaults to `/mnt/sdcard/data_log`
    pub watch_dir: Option<PathBuf>,
    /// Outbox the notecard bridge reads from.
    /// Defaults to `~/.local/share/opensync/outbox`
    pub outbox_dir: Option<PathBuf>,
    /// Flight log file name pattern; the first capture group is the origin.
    pub file_pattern: String,
    /// Seconds between directory polls.
    pub poll_period_secs: u64,
    /// Re-send logs already in the ledger (once per run).
    pub force: bool,
}

/// Ledger configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/opensync/ledger.db`
    pub database_path: Option<PathBuf>,
}

/// Daemon-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the JSON status file.
    /// Defaults to `~/.local/share/opensync/status.json`
    pub status_path: Option<PathBuf>,
    /// Exit with code 255 after the heartbeat is released so the service
    /// manager powers the host off.
    pub enable_shutdown: bool,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: GpioBackend::Sysfs,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            power_fault_pin: 17,
            ups_online_pin: 27,
            heartbeat_pin: 18,
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            debounce_samples: 2,
            drain_deadline_ms: 5_000,
            ups_probe_ms: 1_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_dir: None, // Resolved at runtime
            outbox_dir: None,
            file_pattern: r"log_\d+_\d+_(.*)\.csv".to_string(),
            poll_period_secs: 10,
            force: false,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::ConfigValidation { message });

        if self.power.poll_interval_ms == 0 || self.power.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return invalid(format!(
                "power.poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}, got {}",
                self.power.poll_interval_ms
            ));
        }

        if self.power.debounce_samples == 0 {
            return invalid("power.debounce_samples must be at least 1".to_string());
        }

        if self.power.drain_deadline_ms == 0 {
            return invalid("power.drain_deadline_ms must be greater than 0".to_string());
        }

        if self.sync.poll_period_secs == 0 {
            return invalid("sync.poll_period_secs must be greater than 0".to_string());
        }

        let pins = [
            self.gpio.power_fault_pin,
            self.gpio.ups_online_pin,
            self.gpio.heartbeat_pin,
        ];
        if pins.iter().collect::<HashSet<_>>().len() != pins.len() {
            return invalid(format!(
                "gpio pins must be distinct, got power_fault={} ups_online={} heartbeat={}",
                pins[0], pins[1], pins[2]
            ));
        }

        LogNamePattern::new(&self.sync.file_pattern)?;
        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the status file path, resolving defaults if not set.
    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.daemon
            .status_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(STATUS_FILE_NAME))
    }

    /// Get the watched directory, resolving defaults if not set.
    #[must_use]
    pub fn watch_dir(&self) -> PathBuf {
        self.sync
            .watch_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WATCH_DIR))
    }

    /// Get the outbox directory, resolving defaults if not set.
    #[must_use]
    pub fn outbox_dir(&self) -> PathBuf {
        self.sync
            .outbox_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("outbox"))
    }

    /// Get the power poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.power.poll_interval_ms)
    }

    /// Get the drain deadline as a Duration.
    #[must_use]
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.power.drain_deadline_ms)
    }

    /// Get the UPS probe window, or `None` if the probe is disabled.
    #[must_use]
    pub fn ups_probe_window(&self) -> Option<Duration> {
        (self.power.ups_probe_ms > 0).then(|| Duration::from_millis(self.power.ups_probe_ms))
    }

    /// Get the sync poll period as a Duration.
    #[must_use]
    pub fn sync_poll_period(&self) -> Duration {
        Duration::from_secs(self.sync.poll_period_secs)
    }
}
