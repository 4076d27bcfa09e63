// ABOUTME: TOML configuration for the engine, tool locations and timings
// ABOUTME: Every field has a default so an empty file is a valid config

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding tasks, policies and backups.
    pub database_path: PathBuf,
    /// Directory where backup archives are written.
    pub backup_dir: PathBuf,
    /// Default tracing filter, overridden by RUST_LOG.
    pub log_filter: String,
    pub tools: ToolsConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub mongodump: String,
    pub mongorestore: String,
    pub mongosh: String,
    pub zstd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cancellation_poll_ms: u64,
    pub conflict_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("custodian.db"),
            backup_dir: PathBuf::from("backups"),
            log_filter: "mongo_custodian=info".to_string(),
            tools: ToolsConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mongodump: "mongodump".to_string(),
            mongorestore: "mongorestore".to_string(),
            mongosh: "mongosh".to_string(),
            zstd: "zstd".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancellation_poll_ms: 1000,
            conflict_backoff_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn cancellation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancellation_poll_ms.max(1))
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_secs(self.conflict_backoff_secs)
    }
}

impl Config {
    /// Load configuration from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid configuration")
    }
}
