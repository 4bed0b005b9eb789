//! Configuration system for the Ferry daemon.

use ferry_core::PathsConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ferry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default directories
    #[serde(default = "default_paths")]
    pub paths: PathsConfig,
    /// Concurrency limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Scheduler configuration
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Database configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Concurrency limits. `0` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Transfers receiving a file at the same time
    #[serde(default)]
    pub max_incoming: u64,
    /// Transfers sending a file at the same time
    #[serde(default)]
    pub max_outgoing: u64,
    /// Running transfers started by partners
    #[serde(default)]
    pub max_server_transfers: u64,
    /// Running transfers started by the gateway
    #[serde(default)]
    pub max_client_transfers: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Interval between two scans of the database
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Interval between two progress updates of a running transfer
    #[serde(default = "default_progress_update_interval")]
    pub progress_update_interval_ms: u64,
    /// Time given to a partner to acknowledge a pause, interruption or
    /// cancellation
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_ms: u64,
    /// Time given to running transfers to stop on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_home() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ferry")
}

fn default_paths() -> PathsConfig {
    PathsConfig {
        gateway_home: default_home(),
        default_in_dir: "in".to_string(),
        default_out_dir: "out".to_string(),
        default_tmp_dir: "tmp".to_string(),
    }
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_progress_update_interval() -> u64 {
    1_000
}

fn default_handler_timeout() -> u64 {
    5_000
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

fn default_store_path() -> PathBuf {
    default_home().join("ferry.db.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: default_paths(),
            limits: LimitsConfig::default(),
            controller: ControllerConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            progress_update_interval_ms: default_progress_update_interval(),
            handler_timeout_ms: default_handler_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ControllerConfig {
    /// Interval between two scans of the database
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Interval between two progress updates
    #[must_use]
    pub fn progress_update_interval(&self) -> Duration {
        Duration::from_millis(self.progress_update_interval_ms)
    }

    /// Interruption handler timeout
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Shutdown timeout
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ferry/ferryd.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.controller.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be greater than 0");
        }
        if self.controller.progress_update_interval_ms == 0 {
            anyhow::bail!("Progress update interval must be greater than 0");
        }

        if self.paths.gateway_home.as_os_str().is_empty() {
            anyhow::bail!("Gateway home directory must be set");
        }
        for (name, dir) in [
            ("in", &self.paths.default_in_dir),
            ("out", &self.paths.default_out_dir),
            ("tmp", &self.paths.default_tmp_dir),
        ] {
            if dir.is_empty() {
                anyhow::bail!("Default {name} directory must be set");
            }
        }

        if self.store.path.as_os_str().is_empty() {
            anyhow::bail!("Database path must be set");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.paths.default_in_dir, "in");
        assert_eq!(config.limits.max_outgoing, 0);
        assert_eq!(
            config.controller.progress_update_interval(),
            Duration::from_secs(1)
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.controller.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        config.controller.poll_interval_ms = 500;
        config.paths.default_tmp_dir.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            max_outgoing = 4

            [store]
            path = "/var/lib/ferry/db.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.max_outgoing, 4);
        assert_eq!(config.limits.max_incoming, 0);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/ferry/db.json"));
        assert_eq!(config.controller.poll_interval_ms, 1_000);
        assert_eq!(config.paths.default_out_dir, "out");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/ferryd.toml");

        let mut config = Config::default();
        config.limits.max_client_transfers = 3;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.limits.max_client_transfers, 3);
        assert_eq!(loaded.paths, config.paths);
    }
}
