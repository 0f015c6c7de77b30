//! Recovery configuration
//!
//! Layered from defaults, an optional TOML file, environment variables and
//! finally command-line overrides.

use segrecover_catalog::DbUrl;
use segrecover_core::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete recovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Coordinator connection
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    /// Segment recovery behaviour
    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Rebalance behaviour
    #[serde(default)]
    pub rebalance: RebalanceSettings,

    /// Heap checksum verification
    #[serde(default)]
    pub checksum: ChecksumSettings,

    /// Paths on the cluster hosts and locally
    #[serde(default)]
    pub paths: PathSettings,
}

impl RecoveryConfig {
    /// Load configuration from a TOML file
    ///
    /// Not validated here: environment and CLI overrides are layered on
    /// top first, then the result is checked with [`validate`](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RecoveryConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path).and_then(|c| c.validate().map(|()| c)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.recovery.batch_size) {
            return Err(ConfigError::ValidationError(format!(
                "batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.recovery.batch_size
            )));
        }

        if self.checksum.workers == 0 {
            return Err(ConfigError::ValidationError(
                "checksum workers cannot be 0".to_string(),
            ));
        }

        if self.coordinator.port == 0 {
            return Err(ConfigError::ValidationError(
                "coordinator port cannot be 0".to_string(),
            ));
        }

        if self.rebalance.reconfigure_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reconfigure timeout cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("PGHOST") {
            self.coordinator.host = host;
        }

        if let Some(port) = std::env::var("PGPORT").ok().and_then(|v| v.parse().ok()) {
            self.coordinator.port = port;
        }

        if let Ok(user) = std::env::var("PGUSER") {
            self.coordinator.user = Some(user);
        }

        if let Ok(gphome) = std::env::var("GPHOME") {
            self.paths.gphome = gphome;
        }

        if let Ok(dir) = std::env::var("SEGRECOVER_LOG_DIR") {
            self.paths.log_dir = PathBuf::from(dir);
        }

        if let Some(n) = std::env::var("SEGRECOVER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.recovery.batch_size = n;
        }

        if let Some(secs) = std::env::var("SEGRECOVER_RECONFIGURE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.rebalance.reconfigure_timeout_secs = secs;
        }

        self
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, overrides: CliOverrides) -> Self {
        if let Some(host) = overrides.coordinator_host {
            self.coordinator.host = host;
        }
        if let Some(port) = overrides.coordinator_port {
            self.coordinator.port = port;
        }
        if let Some(n) = overrides.batch_size {
            self.recovery.batch_size = n;
        }
        if let Some(dir) = overrides.log_dir {
            self.paths.log_dir = dir;
        }
        if overrides.force_overwrite {
            self.recovery.force_overwrite = true;
        }
        if overrides.force_full {
            self.recovery.force_full = true;
        }
        if overrides.no_progress {
            self.recovery.show_progress = false;
        }
        self
    }

    /// Rendered as TOML, for `--print-config`
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Command-line values that take precedence over file and environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub coordinator_host: Option<String>,
    pub coordinator_port: Option<u16>,
    pub batch_size: Option<usize>,
    pub log_dir: Option<PathBuf>,
    pub force_overwrite: bool,
    pub force_full: bool,
    pub no_progress: bool,
}

/// Coordinator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl CoordinatorSettings {
    /// Utility-mode URL used for catalog reads and probes
    pub fn db_url(&self) -> DbUrl {
        DbUrl::new(&self.host, self.port, &self.database)
            .utility()
            .with_user(self.user.clone())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    /// Dispatching URL used for the reconfiguration probe
    pub fn dispatch_url(&self) -> DbUrl {
        DbUrl::new(&self.host, self.port, &self.database)
            .with_user(self.user.clone())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "template1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

/// Segment recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Parallel workers per stage
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Allow full recovery into a non-empty relocation target
    #[serde(default)]
    pub force_overwrite: bool,

    /// Always use full recovery
    #[serde(default)]
    pub force_full: bool,

    /// Replication slot used by base backup and rewind
    #[serde(default = "default_replication_slot")]
    pub replication_slot: String,

    /// Tail progress files while recovery runs
    #[serde(default = "default_true")]
    pub show_progress: bool,

    /// Seconds between progress updates
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Seconds pg_ctl waits for a recovered segment to start
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            force_overwrite: false,
            force_full: false,
            replication_slot: default_replication_slot(),
            show_progress: true,
            progress_interval_secs: default_progress_interval(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

impl RecoverySettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_replication_slot() -> String {
    "internal_wal_replication_slot".to_string()
}

fn default_progress_interval() -> u64 {
    2
}

fn default_start_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Rebalance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceSettings {
    /// Wall-clock budget for mirror promotion
    #[serde(default = "default_reconfigure_timeout")]
    pub reconfigure_timeout_secs: u64,

    /// Probe segment hosts over ssh before choosing pairs to rebalance
    #[serde(default = "default_true")]
    pub check_reachability: bool,

    /// Seconds pg_ctl waits for a primary to stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            reconfigure_timeout_secs: default_reconfigure_timeout(),
            check_reachability: true,
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl RebalanceSettings {
    pub fn reconfigure_timeout(&self) -> Duration {
        Duration::from_secs(self.reconfigure_timeout_secs)
    }
}

fn default_reconfigure_timeout() -> u64 {
    600
}

fn default_stop_timeout() -> u64 {
    600
}

/// Heap checksum verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumSettings {
    #[serde(default = "default_checksum_workers")]
    pub workers: usize,
}

impl Default for ChecksumSettings {
    fn default() -> Self {
        Self {
            workers: default_checksum_workers(),
        }
    }
}

fn default_checksum_workers() -> usize {
    8
}

/// Install and log locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Database install directory on every host
    #[serde(default = "default_gphome")]
    pub gphome: String,

    /// Local directory for log and progress files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            gphome: default_gphome(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_gphome() -> String {
    "/usr/local/greenplum-db".to_string()
}

fn default_log_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join("gpAdminLogs"))
        .unwrap_or_else(|_| PathBuf::from("gpAdminLogs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RecoveryConfig::default();
        assert_eq!(config.recovery.batch_size, 16);
        assert_eq!(config.checksum.workers, 8);
        assert_eq!(config.coordinator.database, "template1");
        assert_eq!(config.recovery.replication_slot, "internal_wal_replication_slot");
        assert!(!config.recovery.force_overwrite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[coordinator]\nhost = \"cdw\"\nport = 6432\n\n[recovery]\nbatch_size = 4\n\n[paths]\ngphome = \"/opt/gpdb\""
        )
        .unwrap();

        let config = RecoveryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.coordinator.host, "cdw");
        assert_eq!(config.coordinator.port, 6432);
        assert_eq!(config.recovery.batch_size, 4);
        assert_eq!(config.paths.gphome, "/opt/gpdb");
        assert_eq!(config.rebalance.reconfigure_timeout_secs, 600);
    }

    #[test]
    fn test_batch_size_out_of_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[recovery]\nbatch_size = 65").unwrap();
        let config = RecoveryConfig::from_file(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_cli_batch_size_fixes_file_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[recovery]\nbatch_size = 65").unwrap();

        let config = RecoveryConfig::from_file(file.path())
            .unwrap()
            .with_overrides(CliOverrides {
                batch_size: Some(8),
                ..Default::default()
            });
        assert_eq!(config.recovery.batch_size, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[recovery]\nbatch_size = 0").unwrap();
        let config = RecoveryConfig::load_or_default(file.path());
        assert_eq!(config.recovery.batch_size, 16);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = RecoveryConfig::load_or_default("/nonexistent/segrecover.toml");
        assert_eq!(config.recovery.batch_size, 16);
    }

    #[test]
    fn test_cli_overrides() {
        let config = RecoveryConfig::default().with_overrides(CliOverrides {
            coordinator_host: Some("cdw2".to_string()),
            batch_size: Some(0),
            force_full: true,
            no_progress: true,
            ..Default::default()
        });
        assert_eq!(config.coordinator.host, "cdw2");
        assert!(config.recovery.force_full);
        assert!(!config.recovery.show_progress);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_urls() {
        let settings = CoordinatorSettings::default();
        assert!(settings.db_url().utility);
        assert!(!settings.dispatch_url().utility);
        assert_eq!(settings.db_url().port, 5432);
    }
}
