//! Shared configuration for duet tools
//!
//! Reads from ~/.duet/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Matchmaker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// How often an idle matcher re-reads the queue when no push arrives (ms)
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Age after which another client may take over a reservation (ms)
    #[serde(default = "default_reservation_lease_ms")]
    pub reservation_lease_ms: u64,
    /// Lower bound of the jittered wait after losing a reservation (ms)
    #[serde(default = "default_contention_backoff_min_ms")]
    pub contention_backoff_min_ms: u64,
    /// Upper bound of the jittered wait after losing a reservation (ms)
    #[serde(default = "default_contention_backoff_max_ms")]
    pub contention_backoff_max_ms: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            reservation_lease_ms: default_reservation_lease_ms(),
            contention_backoff_min_ms: default_contention_backoff_min_ms(),
            contention_backoff_max_ms: default_contention_backoff_max_ms(),
        }
    }
}

fn default_scan_interval_ms() -> u64 {
    250
}

fn default_reservation_lease_ms() -> u64 {
    5000
}

fn default_contention_backoff_min_ms() -> u64 {
    50
}

fn default_contention_backoff_max_ms() -> u64 {
    250
}

/// Signaling timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bounded wait for the peer's offer/answer (ms)
    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,
    /// Bounded wait for the media link to come up (ms)
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: default_answer_timeout_ms(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
        }
    }
}

fn default_answer_timeout_ms() -> u64 {
    10_000
}

fn default_negotiation_timeout_ms() -> u64 {
    20_000
}

/// Re-entry and backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Delay before re-queueing after a skip; rapid skips coalesce into one (ms)
    #[serde(default = "default_skip_delay_ms")]
    pub skip_delay_ms: u64,
    /// Delay before re-queueing after a failure (ms)
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Cap for the doubling failure backoff (ms)
    #[serde(default = "default_max_failure_backoff_ms")]
    pub max_failure_backoff_ms: u64,
    /// How long a partner who left before the media link came up is not
    /// picked again (ms)
    #[serde(default = "default_early_leave_cooldown_ms")]
    pub early_leave_cooldown_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            skip_delay_ms: default_skip_delay_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
            max_failure_backoff_ms: default_max_failure_backoff_ms(),
            early_leave_cooldown_ms: default_early_leave_cooldown_ms(),
        }
    }
}

fn default_skip_delay_ms() -> u64 {
    500
}

fn default_failure_backoff_ms() -> u64 {
    3000
}

fn default_max_failure_backoff_ms() -> u64 {
    30_000
}

fn default_early_leave_cooldown_ms() -> u64 {
    60_000
}

/// Local storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    get_duet_dir().join("data").to_string_lossy().to_string()
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from an explicit path, writing defaults there if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content =
                fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    /// Save config to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }
}

/// Get the duet directory (~/.duet)
pub fn get_duet_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DUET_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".duet")
}

/// Get the config file path (~/.duet/config.toml)
pub fn get_config_path() -> PathBuf {
    get_duet_dir().join("config.toml")
}

/// Get the data directory from config (defaults to ~/.duet/data)
/// Can be overridden with DUET_DATA_DIR environment variable
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DUET_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let config = Config::load_or_default();
    PathBuf::from(&config.storage.data_dir)
}

/// Path of the persisted device identity and block-list
pub fn get_state_path() -> PathBuf {
    get_data_dir().join("state.json")
}
