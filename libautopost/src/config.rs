//! Configuration management for Autopost

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::platforms::PROCESSING_WAIT;
use crate::types::Platform;

pub const CONFIG_ENV: &str = "AUTOPOST_CONFIG";
pub const DB_PATH_ENV: &str = "AUTOPOST_DB_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Keyed by platform name, e.g. `[platforms.youtube]`
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Maximum records admitted per tick
    pub batch_size: u32,
    /// In-flight claims older than this are considered abandoned. Must
    /// outlast the slowest attempt: refresh, publish, forced refresh, publish.
    pub stale_claim_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            batch_size: 100,
            stale_claim_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent publish attempts
    pub workers: usize,
    /// Refresh and metrics calls, and connection setup for every request
    pub call_timeout_secs: u64,
    /// Whole publish call, uploads and processing waits included
    pub publish_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_rate_limit_reschedules: u32,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            call_timeout_secs: 30,
            publish_timeout_secs: 900,
            max_attempts: 5,
            base_delay_secs: 2,
            max_delay_secs: 300,
            max_rate_limit_reschedules: 5,
            queue_capacity: 256,
        }
    }
}

impl DispatcherConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Longest a claimed target can legitimately stay in flight
    pub fn worst_case_attempt_secs(&self) -> u64 {
        2 * (self.call_timeout_secs + self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Tokens expiring within this many seconds are refreshed before use
    pub refresh_margin_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub root: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: "~/.local/share/autopost/media".to_string(),
        }
    }
}

impl MediaConfig {
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.root).to_string())
    }
}

/// OAuth application settings for one platform
#[derive(Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Override the API endpoint, mainly for staging environments
    pub api_base: Option<String>,
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("enabled", &self.enabled)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/autopost/autopost.db".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            credentials: CredentialsConfig::default(),
            analytics: AnalyticsConfig::default(),
            media: MediaConfig::default(),
            platforms: BTreeMap::new(),
        }
    }

    /// Database path after `AUTOPOST_DB_PATH` override and `~` expansion
    pub fn db_path(&self) -> String {
        let raw = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| self.database.path.clone());
        shellexpand::tilde(&raw).to_string()
    }

    /// Enabled platform sections, parsed
    pub fn enabled_platforms(&self) -> Result<Vec<(Platform, &PlatformConfig)>> {
        let mut enabled = Vec::new();
        for (name, platform_config) in &self.platforms {
            let platform: Platform = name.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("platforms.{}", name),
                reason: "unknown platform".to_string(),
            })?;
            if platform_config.enabled {
                enabled.push((platform, platform_config));
            }
        }
        Ok(enabled)
    }

    fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(invalid("scheduler.tick_interval_secs", "must be positive").into());
        }
        if self.scheduler.batch_size == 0 {
            return Err(invalid("scheduler.batch_size", "must be positive").into());
        }
        if self.dispatcher.workers == 0 {
            return Err(invalid("dispatcher.workers", "must be positive").into());
        }
        if self.dispatcher.call_timeout_secs == 0 {
            return Err(invalid("dispatcher.call_timeout_secs", "must be positive").into());
        }
        if self.dispatcher.publish_timeout_secs <= PROCESSING_WAIT.as_secs() {
            return Err(invalid(
                "dispatcher.publish_timeout_secs",
                &format!(
                    "must exceed the {}s adapters may wait for upload processing",
                    PROCESSING_WAIT.as_secs()
                ),
            )
            .into());
        }
        if self.scheduler.stale_claim_secs <= self.dispatcher.worst_case_attempt_secs() {
            return Err(invalid(
                "scheduler.stale_claim_secs",
                &format!(
                    "must exceed {}s, the longest attempt (two refreshes and two publishes)",
                    self.dispatcher.worst_case_attempt_secs()
                ),
            )
            .into());
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(invalid("dispatcher.max_attempts", "must be at least 1").into());
        }
        if self.dispatcher.base_delay_secs == 0 {
            return Err(invalid("dispatcher.base_delay_secs", "must be positive").into());
        }
        if self.dispatcher.base_delay_secs > self.dispatcher.max_delay_secs {
            return Err(invalid(
                "dispatcher.max_delay_secs",
                "must not be smaller than base_delay_secs",
            )
            .into());
        }
        if self.analytics.interval_secs == 0 {
            return Err(invalid("analytics.interval_secs", "must be positive").into());
        }
        self.enabled_platforms()?;
        Ok(())
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("autopost").join("config.toml"))
}
