//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default lock time-to-live in milliseconds.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
/// Default missed-heartbeat timeout in milliseconds.
pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 15_000;
/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// Default undo history depth (in undo steps).
pub const DEFAULT_UNDO_DEPTH: usize = 100;
/// Default reconnect reload debounce in milliseconds.
pub const DEFAULT_RELOAD_DEBOUNCE_MS: u64 = 1_000;
/// Default tolerance for remote stamps ahead of the local clock (one day).
pub const DEFAULT_MAX_CLOCK_SKEW_MS: u64 = 86_400_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("could not determine a data directory")]
    NoDataDir,
}

/// Tunables for a synchronized project session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a lock stays valid without renewal.
    pub lock_ttl_ms: u64,
    /// A presence record older than this is stale.
    pub presence_timeout_ms: u64,
    /// How often the local user's presence is re-published.
    pub heartbeat_interval_ms: u64,
    /// How often expired locks are swept.
    pub stale_sweep_interval_ms: u64,
    /// Maximum number of undo steps kept.
    pub undo_depth: usize,
    /// Quiet period after reconnecting before the full reload.
    pub reload_debounce_ms: u64,
    /// First retry delay of the offline queue.
    pub retry_base_delay_ms: u64,
    /// Upper bound of the retry delay.
    pub retry_max_delay_ms: u64,
    /// Attempts before the queue head becomes a persistent failure.
    pub max_retries: u32,
    /// Remote shapes stamped further than this ahead of the local clock are
    /// rejected as malformed.
    pub max_clock_skew_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            stale_sweep_interval_ms: 5_000,
            undo_depth: DEFAULT_UNDO_DEPTH,
            reload_debounce_ms: DEFAULT_RELOAD_DEBOUNCE_MS,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            max_retries: 8,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration file, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Default config location.
    ///
    /// On Unix: `~/.local/share/scopeink/sync.json`
    /// On Windows: `%LOCALAPPDATA%\scopeink\sync.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or(ConfigError::NoDataDir)?;
        Ok(base.join("scopeink").join("sync.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{"lock_ttl_ms": 10000}"#).unwrap();
        assert_eq!(config.lock_ttl_ms, 10_000);
        assert_eq!(config.undo_depth, DEFAULT_UNDO_DEPTH);
        assert_eq!(config.reload_debounce_ms, DEFAULT_RELOAD_DEBOUNCE_MS);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, r#"{"max_retries": 3, "undo_depth": 10}"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.undo_depth, 10);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            SyncConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
