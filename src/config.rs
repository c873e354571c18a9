//! Configuration for the conductor, read from `conductor.toml`.
//!
//! Layered: serde defaults → file → environment → CLI flags. Every section
//! is optional; a missing file yields the defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! data_dir = ".conductor"
//!
//! [dispatcher]
//! urgent_limit = 2
//! normal_limit = 4
//! background_limit = 2
//! max_workers = 4
//!
//! [lease]
//! ttl_ms = 300000
//! acquire_timeout_ms = 30000
//! backoff_base_ms = 100
//! backoff_max_ms = 5000
//!
//! [coordinator]
//! liveness_timeout_ms = 60000
//! liveness_interval_ms = 10000
//! default_expected_completion_ms = 600000
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::coordinator::CoordinatorConfig;
use crate::dispatch::DispatcherConfig;
use crate::lease::{DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_TTL_MS, LeaseConfig};

pub const CONFIG_FILE: &str = "conductor.toml";
pub const DB_FILE: &str = "conductor.db";

/// Storage location section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Directory holding the shared database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".conductor")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Lane limits and the worker cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_urgent_limit")]
    pub urgent_limit: usize,
    #[serde(default = "default_normal_limit")]
    pub normal_limit: usize,
    #[serde(default = "default_background_limit")]
    pub background_limit: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_urgent_limit() -> usize {
    2
}

fn default_normal_limit() -> usize {
    4
}

fn default_background_limit() -> usize {
    2
}

fn default_max_workers() -> usize {
    4
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            urgent_limit: default_urgent_limit(),
            normal_limit: default_normal_limit(),
            background_limit: default_background_limit(),
            max_workers: default_max_workers(),
        }
    }
}

/// Lease TTL and acquisition retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: i64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_ttl_ms() -> i64 {
    DEFAULT_TTL_MS
}

fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Worker liveness and claim horizon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: i64,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    #[serde(default = "default_expected_completion_ms")]
    pub default_expected_completion_ms: i64,
}

fn default_liveness_timeout_ms() -> i64 {
    60_000
}

fn default_liveness_interval_ms() -> u64 {
    10_000
}

fn default_expected_completion_ms() -> i64 {
    600_000
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: default_liveness_timeout_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            default_expected_completion_ms: default_expected_completion_ms(),
        }
    }
}

/// Root configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
}

impl ConductorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load from `<dir>/conductor.toml`, then apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Environment variables beat the file; CLI flags beat both (applied by
    /// the command layer after loading).
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("CONDUCTOR_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("CONDUCTOR_MAX_WORKERS") {
            self.dispatcher.max_workers = v
                .parse()
                .context("CONDUCTOR_MAX_WORKERS must be an integer")?;
        }
        if let Ok(v) = std::env::var("CONDUCTOR_LEASE_TTL_MS") {
            self.lease.ttl_ms = v
                .parse()
                .context("CONDUCTOR_LEASE_TTL_MS must be an integer")?;
        }
        Ok(())
    }

    /// Path of the shared SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.store.data_dir.join(DB_FILE)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            urgent_limit: self.dispatcher.urgent_limit,
            normal_limit: self.dispatcher.normal_limit,
            background_limit: self.dispatcher.background_limit,
            max_workers: self.dispatcher.max_workers,
        }
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl_ms: self.lease.ttl_ms,
            acquire_timeout_ms: self.lease.acquire_timeout_ms,
            backoff: BackoffConfig {
                base_ms: self.lease.backoff_base_ms,
                max_ms: self.lease.backoff_max_ms,
                ..BackoffConfig::default()
            },
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            liveness_timeout_ms: self.coordinator.liveness_timeout_ms,
            liveness_interval_ms: self.coordinator.liveness_interval_ms,
            default_expected_completion_ms: self.coordinator.default_expected_completion_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = ConductorConfig::default();
        assert_eq!(config.store.data_dir, PathBuf::from(".conductor"));
        assert_eq!(config.dispatcher.max_workers, 4);
        assert_eq!(config.lease.ttl_ms, DEFAULT_TTL_MS);
        assert_eq!(config.coordinator.liveness_timeout_ms, 60_000);
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults_elsewhere() {
        let config = ConductorConfig::parse(
            r#"
            [dispatcher]
            urgent_limit = 1
            max_workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.urgent_limit, 1);
        assert_eq!(config.dispatcher.max_workers, 8);
        // Untouched sections fall back to defaults.
        assert_eq!(config.dispatcher.normal_limit, 4);
        assert_eq!(config.lease.ttl_ms, DEFAULT_TTL_MS);
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        assert!(ConductorConfig::parse("[dispatcher\nmax_workers = 8").is_err());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = ConductorConfig::default();
        config.dispatcher.max_workers = 7;
        config.save(&path).unwrap();

        let loaded = ConductorConfig::load(&path).unwrap();
        assert_eq!(loaded.dispatcher.max_workers, 7);
    }

    #[test]
    fn test_subsystem_config_conversion() {
        let mut config = ConductorConfig::default();
        config.lease.backoff_base_ms = 50;
        config.lease.ttl_ms = 1_000;

        let lease = config.lease_config();
        assert_eq!(lease.ttl_ms, 1_000);
        assert_eq!(lease.backoff.base_ms, 50);
        assert_eq!(lease.backoff.max_ms, 5_000);

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.urgent_limit, 2);
    }

    #[test]
    fn test_db_path_under_data_dir() {
        let config = ConductorConfig::default();
        assert_eq!(config.db_path(), PathBuf::from(".conductor/conductor.db"));
    }
}
