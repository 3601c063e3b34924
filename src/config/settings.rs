//! Configuration settings for shelfsync.
//!
//! Settings are loaded from `~/.shelfsync/config.yaml`. Every field has a
//! default, so a partial file (or no file) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Paths;
use crate::error::SyncError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Push, pull, and retry tuning.
    pub sync: SyncSettings,
    /// Log filter.
    pub logging: LoggingConfig,
}

/// Sync engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    /// Maximum operations submitted in one batch call.
    #[serde(default = "default_push_batch_limit")]
    pub push_batch_limit: usize,
    /// Records requested per pull page.
    #[serde(default = "default_pull_page_size")]
    pub pull_page_size: usize,
    /// Seconds between periodic background flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Seconds between periodic background pulls.
    #[serde(default = "default_pull_interval")]
    pub pull_interval_secs: u64,
    /// Attempts before a retryable failure is surfaced as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay after a deferred flush.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Backoff ceiling.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `shelfsync=debug`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions for serde
const fn default_push_batch_limit() -> usize {
    50
}

const fn default_pull_page_size() -> usize {
    200
}

const fn default_flush_interval() -> u64 {
    300
}

const fn default_pull_interval() -> u64 {
    900
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_backoff_base() -> u64 {
    5
}

const fn default_backoff_max() -> u64 {
    300
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            push_batch_limit: default_push_batch_limit(),
            pull_page_size: default_pull_page_size(),
            flush_interval_secs: default_flush_interval(),
            pull_interval_secs: default_pull_interval(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl SyncSettings {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    #[must_use]
    pub const fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self, SyncError> {
        let paths = Paths::new()?;
        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        serde_yaml::from_str(&contents).map_err(|e| {
            SyncError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), SyncError> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents).map_err(|e| {
            SyncError::Config(format!(
                "Failed to write config file {}: {e}",
                path.display()
            ))
        })
    }
}
