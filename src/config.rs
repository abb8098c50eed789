//! Configuration management for Ratekeeper.
//!
//! Configuration is read from an optional YAML file and overridden by
//! `RATEKEEPER__*` environment variables, with `__` separating nested keys
//! (e.g. `RATEKEEPER__BACKEND__TYPE=sqlite`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::{
    default_rules, FailurePolicy, MemoryBackend, RateLimitManager, RateLimitRule, RuleSet,
    SharedBackend, SqliteBackend,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counter storage
    #[serde(default)]
    pub backend: BackendConfig,

    /// What to do when the backend fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Background maintenance
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Inline rules
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,

    /// Additional rules loaded from a YAML file
    #[serde(default)]
    pub rules_file: Option<PathBuf>,

    /// Identities that bypass every rule
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Identities rejected outright
    #[serde(default)]
    pub blacklist: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Counter storage selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local storage
    #[default]
    Memory,
    /// SQLite database, e.g. `sqlite://ratekeeper.db` or `sqlite::memory:`
    Sqlite { url: String },
    /// Redis server, e.g. `redis://127.0.0.1:6379`
    Redis { url: String },
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between expired-state sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

impl AppConfig {
    /// Load configuration from an optional file plus `RATEKEEPER__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("whitelist")
                    .with_list_parse_key("blacklist"),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maintenance.cleanup_interval_secs == 0 {
            return Err(RateLimitError::Config(
                "maintenance.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        RuleSet {
            rules: self.rules.clone(),
        }
        .validate()
    }

    /// The rules to enforce: inline rules plus the rules file, or the
    /// built-in defaults when neither provides any.
    pub fn effective_rules(&self) -> Result<Vec<RateLimitRule>> {
        let mut rules = self.rules.clone();
        if let Some(path) = &self.rules_file {
            rules.extend(RuleSet::from_file(path)?.rules);
        }

        if rules.is_empty() {
            info!("No rate limit rules configured, using defaults");
            return Ok(default_rules());
        }

        let set = RuleSet { rules };
        set.validate()?;
        Ok(set.rules)
    }

    /// Open the configured counter backend.
    pub async fn build_backend(&self) -> Result<SharedBackend> {
        let backend: SharedBackend = match &self.backend {
            BackendConfig::Memory => Arc::new(MemoryBackend::new()),
            BackendConfig::Sqlite { url } => Arc::new(SqliteBackend::connect(url).await?),
            #[cfg(feature = "redis-backend")]
            BackendConfig::Redis { url } => {
                Arc::new(crate::ratelimit::RedisBackend::connect(url).await?)
            }
            #[cfg(not(feature = "redis-backend"))]
            BackendConfig::Redis { .. } => {
                return Err(RateLimitError::Config(
                    "redis backend requires the `redis-backend` feature".to_string(),
                ))
            }
        };
        info!(backend = backend.name(), "Rate limit backend ready");
        Ok(backend)
    }

    /// Build a manager with the configured backend, rules and lists.
    pub async fn build_manager(&self) -> Result<RateLimitManager> {
        let rules = self.effective_rules()?;
        let backend = self.build_backend().await?;

        RateLimitManager::builder(backend)
            .failure_policy(self.failure_policy)
            .rules(rules)
            .whitelist(self.whitelist.iter().cloned())
            .blacklist(self.blacklist.iter().cloned())
            .build()
    }
}
