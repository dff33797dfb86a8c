//! Configuration loading and typed config structures for rpgvault.
//!
//! The canonical configuration lives in `rpgvault.yaml` next to the host
//! binary. This module defines strongly-typed structs that mirror the YAML
//! structure, and provides a loader that reads it. Every field has a
//! default, so a missing file or an empty document yields a working setup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable that overrides `storage.database_url`.
pub const DATABASE_URL_ENV: &str = "RPGVAULT_DATABASE_URL";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
///
/// Mirrors the structure of `rpgvault.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VaultConfig {
    /// Durable store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Worker pool and queueing settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Retry policy for transient storage failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Autosave, leave grace, and shutdown timing.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Reference host settings.
    #[serde(default)]
    pub host: HostConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VaultConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `RPGVAULT_DATABASE_URL` overrides `storage.database_url` when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Same as [`VaultConfig::from_file`] for an existing file.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::from_file(path);
        }
        tracing::info!(path = %path.display(), "No config file found, using defaults");
        let mut config = Self::default();
        config.storage.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to a mapping.
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.storage.apply_env_overrides();
        Ok(config)
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum pooled connections. Clamped to the worker count at startup.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a connection waits on a locked database, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    /// Override the database URL from the environment when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_database_url(std::env::var(DATABASE_URL_ENV).ok());
    }

    fn apply_database_url(&mut self, value: Option<String>) {
        if let Some(url) = value.filter(|v| !v.trim().is_empty()) {
            self.database_url = url;
        }
    }

    /// Busy timeout as a [`Duration`].
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Async execution bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    /// Worker threads (and concurrent gateway calls).
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Maximum queued operations per player (in flight + pending).
    #[serde(default = "default_queue_bound")]
    pub per_player_queue_bound: usize,

    /// Upper bound on a single gateway call, in milliseconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl BridgeConfig {
    /// Operation timeout as a [`Duration`].
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            per_player_queue_bound: default_queue_bound(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Lifecycle timing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LifecycleConfig {
    /// Ticks between autosave sweeps. Zero disables the sweep.
    #[serde(default = "default_autosave_interval_ticks")]
    pub autosave_interval_ticks: u64,

    /// How long a departed player's final save may take before the entry
    /// is dropped with a durability warning, in milliseconds.
    #[serde(default = "default_leave_grace_ms")]
    pub leave_grace_ms: u64,

    /// Upper bound on the shutdown flush, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl LifecycleConfig {
    /// Leave grace as a [`Duration`].
    pub const fn leave_grace(&self) -> Duration {
        Duration::from_millis(self.leave_grace_ms)
    }

    /// Shutdown timeout as a [`Duration`].
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            autosave_interval_ticks: default_autosave_interval_ticks(),
            leave_grace_ms: default_leave_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Reference host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    /// Real-time milliseconds per tick.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl HostConfig {
    /// Tick interval as a [`Duration`].
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_database_url() -> String {
    String::from("sqlite://data/rpgvault.db")
}

const fn default_max_connections() -> u32 {
    4
}

const fn default_busy_timeout_ms() -> u64 {
    5000
}

const fn default_worker_threads() -> usize {
    4
}

const fn default_queue_bound() -> usize {
    2
}

const fn default_operation_timeout_ms() -> u64 {
    5000
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    100
}

const fn default_max_delay_ms() -> u64 {
    5000
}

const fn default_autosave_interval_ticks() -> u64 {
    1200
}

const fn default_leave_grace_ms() -> u64 {
    10_000
}

const fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

const fn default_tick_interval_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    String::from("info")
}
