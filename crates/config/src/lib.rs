//! Configuration loading, validation, and management for threadgate.
//!
//! Loads configuration from `~/.threadgate/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.threadgate/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Thread lifecycle limits and TTL windows
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Token ceiling and per-class shares
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Large-payload offload
    #[serde(default)]
    pub offload: OffloadConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// SQLite database file (defaults to `~/.threadgate/threads.sqlite`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<String>,

    /// Upper bound for a single backend call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Optimistic-append retries before reporting contention
    #[serde(default = "default_max_append_retries")]
    pub max_append_retries: u32,

    /// Active expiry sweep period; 0 disables the sweeper
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_store_backend() -> String {
    "memory".into()
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_max_append_retries() -> u32 {
    32
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            sqlite_path: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            max_append_retries: default_max_append_retries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| AppConfig::config_dir().join("threads.sqlite"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    #[serde(default = "default_standard_ttl_hours")]
    pub standard_ttl_hours: u64,

    #[serde(default = "default_extended_ttl_hours")]
    pub extended_ttl_hours: u64,

    /// How far `chain` walks up parent links
    #[serde(default = "default_max_parent_depth")]
    pub max_parent_depth: usize,
}

fn default_max_turns() -> usize {
    50
}
fn default_standard_ttl_hours() -> u64 {
    3
}
fn default_extended_ttl_hours() -> u64 {
    48
}
fn default_max_parent_depth() -> usize {
    20
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            standard_ttl_hours: default_standard_ttl_hours(),
            extended_ttl_hours: default_extended_ttl_hours(),
            max_parent_depth: default_max_parent_depth(),
        }
    }
}

impl ConversationConfig {
    pub fn standard_ttl(&self) -> Duration {
        Duration::from_secs(self.standard_ttl_hours * 3600)
    }

    pub fn extended_ttl(&self) -> Duration {
        Duration::from_secs(self.extended_ttl_hours * 3600)
    }
}

/// Token ceiling and the nominal split of the file budget between
/// priority classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Used when a request does not carry its own ceiling
    #[serde(default = "default_token_ceiling")]
    pub default_token_ceiling: usize,

    #[serde(default = "default_source_share")]
    pub source_share: f64,

    #[serde(default = "default_config_share")]
    pub config_share: f64,

    #[serde(default = "default_docs_share")]
    pub docs_share: f64,

    #[serde(default = "default_other_share")]
    pub other_share: f64,
}

fn default_token_ceiling() -> usize {
    200_000
}
fn default_source_share() -> f64 {
    0.60
}
fn default_config_share() -> f64 {
    0.25
}
fn default_docs_share() -> f64 {
    0.10
}
fn default_other_share() -> f64 {
    0.05
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_token_ceiling: default_token_ceiling(),
            source_share: default_source_share(),
            config_share: default_config_share(),
            docs_share: default_docs_share(),
            other_share: default_other_share(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Prompts longer than this many bytes are written to a file
    #[serde(default = "default_offload_threshold")]
    pub threshold_bytes: usize,

    /// Directory for transient prompt files (defaults to `~/.threadgate/offload`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

fn default_offload_threshold() -> usize {
    50_000
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_offload_threshold(),
            dir: None,
        }
    }
}

impl OffloadConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| AppConfig::config_dir().join("offload"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.threadgate/config.toml).
    ///
    /// Environment variables override the file:
    /// - `THREADGATE_STORE_BACKEND`, `THREADGATE_SQLITE_PATH`
    /// - `THREADGATE_STANDARD_TTL_HOURS`, `THREADGATE_EXTENDED_TTL_HOURS`
    /// - `THREADGATE_MAX_TURNS`, `THREADGATE_OFFLOAD_THRESHOLD`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(backend) = lookup("THREADGATE_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Some(path) = lookup("THREADGATE_SQLITE_PATH") {
            self.store.sqlite_path = Some(path);
        }
        if let Some(hours) = lookup("THREADGATE_STANDARD_TTL_HOURS") {
            self.conversation.standard_ttl_hours = parse_env("THREADGATE_STANDARD_TTL_HOURS", &hours)?;
        }
        if let Some(hours) = lookup("THREADGATE_EXTENDED_TTL_HOURS") {
            self.conversation.extended_ttl_hours = parse_env("THREADGATE_EXTENDED_TTL_HOURS", &hours)?;
        }
        if let Some(turns) = lookup("THREADGATE_MAX_TURNS") {
            self.conversation.max_turns = parse_env("THREADGATE_MAX_TURNS", &turns)?;
        }
        if let Some(threshold) = lookup("THREADGATE_OFFLOAD_THRESHOLD") {
            self.offload.threshold_bytes = parse_env("THREADGATE_OFFLOAD_THRESHOLD", &threshold)?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".threadgate")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.store.backend.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "store.backend must be \"memory\" or \"sqlite\", got \"{}\"",
                self.store.backend
            )));
        }

        if self.conversation.standard_ttl_hours == 0 {
            return Err(ConfigError::ValidationError(
                "conversation.standard_ttl_hours must be > 0".into(),
            ));
        }

        if self.conversation.extended_ttl_hours < self.conversation.standard_ttl_hours {
            return Err(ConfigError::ValidationError(
                "conversation.extended_ttl_hours must be >= standard_ttl_hours".into(),
            ));
        }

        if self.conversation.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "conversation.max_turns must be > 0".into(),
            ));
        }

        let shares = [
            self.budget.source_share,
            self.budget.config_share,
            self.budget.docs_share,
            self.budget.other_share,
        ];
        if shares.iter().any(|s| *s < 0.0) {
            return Err(ConfigError::ValidationError(
                "budget shares must not be negative".into(),
            ));
        }
        let total: f64 = shares.iter().sum();
        if (total - 1.0).abs() > 0.001 {
            return Err(ConfigError::ValidationError(format!(
                "budget shares must sum to 1.0, got {total:.3}"
            )));
        }

        if self.offload.threshold_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "offload.threshold_bytes must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has invalid value \"{value}\"")))
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
