//! Engine configuration management.
//!
//! This module handles loading and saving the engine configuration, which
//! covers the local storage location, remote table name, retry and backoff
//! tuning, and the pay-calculation defaults.
//!
//! Configuration is stored at `~/.config/shiftsync/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/storage directory paths
const APP_NAME: &str = "shiftsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

fn default_table() -> String {
    "schedule_entries".to_string()
}

fn default_max_sync_retries() -> u32 {
    3
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_overtime_threshold() -> f64 {
    40.0
}

fn default_overtime_multiplier() -> f64 {
    1.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the durable schedule document lives. Defaults to the platform
    /// data directory when unset.
    pub storage_dir: Option<PathBuf>,
    /// Remote table holding schedule entries.
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_max_sync_retries")]
    pub max_sync_retries: u32,
    /// Quiet period for the debounced save strategy.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Base delay for realtime reconnection; grows linearly per attempt.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Change-feed poll interval for the HTTP backend.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// When set, the realtime pipeline only ingests entries assigned to this
    /// worker.
    #[serde(default)]
    pub worker_filter: Option<String>,
    /// Rate substituted when a new entry carries none.
    #[serde(default)]
    pub default_hourly_rate: f64,
    /// Weekly hours at or under which a worker's time is regular pay.
    #[serde(default = "default_overtime_threshold")]
    pub overtime_threshold: f64,
    #[serde(default = "default_overtime_multiplier")]
    pub overtime_multiplier: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            table: default_table(),
            max_sync_retries: default_max_sync_retries(),
            debounce_ms: default_debounce_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_filter: None,
            default_hourly_rate: 0.0,
            overtime_threshold: default_overtime_threshold(),
            overtime_multiplier: default_overtime_multiplier(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Resolved storage directory for the durable schedule document.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.table, "schedule_entries");
        assert_eq!(config.max_sync_retries, 3);
        assert_eq!(config.debounce_ms, 300);
        assert_eq!(config.overtime_threshold, 40.0);
        assert_eq!(config.overtime_multiplier, 1.5);
    }

    #[test]
    fn test_partial_config_file_parses_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"storage_dir": null, "worker_filter": "w1"}"#)
                .expect("partial config parses");
        assert_eq!(config.worker_filter.as_deref(), Some("w1"));
        assert_eq!(config.max_sync_retries, 3);
    }
}
