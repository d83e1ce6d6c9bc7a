//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/vidmirror/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/vidmirror/` (~/.config/vidmirror/)
//! - Data: `$XDG_DATA_HOME/vidmirror/` (~/.local/share/vidmirror/)
//! - State/Logs: `$XDG_STATE_HOME/vidmirror/` (~/.local/state/vidmirror/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Catch-up and backfill scan policy
    #[serde(default)]
    pub scan: ScanConfig,

    /// Self-throttling and retry policy
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Platform gateway endpoint
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Credential pool (relays + owner)
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,

    /// Relay container used to stage restricted items
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scan policy shared by catch-up and backfill.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Consecutive already-known items that stop a catch-up scan
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: u32,

    /// Max new items to mirror per container per run (None = unbounded)
    #[serde(default)]
    pub per_run_cap: Option<u64>,

    /// Remote history page size
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Containers scanned concurrently (keep small; local store contention)
    #[serde(default = "default_container_concurrency")]
    pub container_concurrency: usize,

    /// New items buffered before a store flush
    #[serde(default = "default_persist_batch")]
    pub persist_batch: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            stop_threshold: default_stop_threshold(),
            per_run_cap: None,
            page_size: default_page_size(),
            container_concurrency: default_container_concurrency(),
            persist_batch: default_persist_batch(),
        }
    }
}

fn default_stop_threshold() -> u32 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_container_concurrency() -> usize {
    1
}

fn default_persist_batch() -> usize {
    50
}

/// Rate-limit reaction and self-imposed throttling.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Consecutive successes before a forced idle window
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u64,

    /// Length of the forced idle window in seconds
    #[serde(default = "default_burst_idle_secs")]
    pub burst_idle_secs: u64,

    /// Bounded retries for transient remote errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff for transient retries, in milliseconds
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Per-call timeout in seconds; a timeout is a transient failure
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            burst_limit: default_burst_limit(),
            burst_idle_secs: default_burst_idle_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_burst_limit() -> u64 {
    30
}

fn default_burst_idle_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    20
}

/// Platform gateway endpoint shared by all credentials.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    /// Base URL, e.g. `https://gateway.example.com`
    pub base_url: Option<String>,
}

/// One authenticated platform identity.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    /// Stable name used in logs and telemetry
    pub name: String,

    /// Relay bot or direct-owner session
    pub kind: crate::types::CredentialKind,

    /// Bearer token for the gateway
    pub token: Option<String>,

    /// Statically excluded: never scheduled
    #[serde(default)]
    pub excluded: bool,
}

/// Relay container used to stage items restricted at the origin.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelayConfig {
    /// Container id relay credentials read from
    pub container_id: Option<i64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.scan.stop_threshold == 0 {
            return Err(Error::Config("scan.stop_threshold must be >= 1".to_string()));
        }
        if self.scan.page_size == 0 {
            return Err(Error::Config("scan.page_size must be >= 1".to_string()));
        }
        if self.scan.container_concurrency == 0 || self.scan.container_concurrency > 5 {
            return Err(Error::Config(
                "scan.container_concurrency must be between 1 and 5".to_string(),
            ));
        }
        let usable = self.credentials.iter().filter(|c| !c.excluded).count();
        if !self.credentials.is_empty() && usable == 0 {
            return Err(Error::Config(
                "all configured credentials are excluded".to_string(),
            ));
        }
        for cred in &self.credentials {
            if cred.name.is_empty() {
                return Err(Error::Config("credential name must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/vidmirror/config.toml` (~/.config/vidmirror/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("vidmirror").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite mirror)
    ///
    /// `$XDG_DATA_HOME/vidmirror/` (~/.local/share/vidmirror/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("vidmirror")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/vidmirror/` (~/.local/state/vidmirror/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("vidmirror")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/vidmirror/mirror.db` (~/.local/share/vidmirror/mirror.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("mirror.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/vidmirror/vidmirror.log` (~/.local/state/vidmirror/vidmirror.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("vidmirror.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialKind;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scan.stop_threshold, 30);
        assert_eq!(config.scan.page_size, 100);
        assert_eq!(config.scan.container_concurrency, 1);
        assert_eq!(config.throttle.burst_limit, 30);
        assert_eq!(config.throttle.max_retries, 3);
        assert!(config.credentials.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[scan]
stop_threshold = 50
per_run_cap = 200
container_concurrency = 3

[throttle]
burst_limit = 20
burst_idle_secs = 45

[gateway]
base_url = "https://gateway.example.com"

[relay]
container_id = -1001234567890

[[credentials]]
name = "relay-1"
kind = "relay"
token = "tok_a"

[[credentials]]
name = "owner"
kind = "owner"
token = "tok_b"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.scan.stop_threshold, 50);
        assert_eq!(config.scan.per_run_cap, Some(200));
        assert_eq!(config.scan.container_concurrency, 3);
        assert_eq!(config.throttle.burst_limit, 20);
        assert_eq!(config.relay.container_id, Some(-1001234567890));
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials[0].kind, CredentialKind::Relay);
        assert_eq!(config.credentials[1].kind, CredentialKind::Owner);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.scan.stop_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scan.container_concurrency = 6;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.credentials.push(CredentialConfig {
            name: "relay-1".to_string(),
            kind: CredentialKind::Relay,
            token: None,
            excluded: true,
        });
        assert!(config.validate().is_err());
    }
}
