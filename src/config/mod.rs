//! Configuration for Gatekeeper
//!
//! Loads routing configuration from TOML files and environment variables.

mod env;
mod types;

pub use env::EnvBootstrap;
pub use types::*;

use crate::health::HealthConfig;
use crate::router::{MapperOptions, MappingRule, PatternMatcher};
use crate::ServiceAccount;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main Gatekeeper configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Routing behaviour
    pub routing: RoutingConfig,
    /// Health monitoring
    pub health: HealthSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Service accounts
    pub accounts: Vec<ServiceAccount>,
    /// Mapping rules
    pub rules: Vec<MappingRule>,
}

impl RouterConfig {
    /// Load configuration from a file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Self::from_raw(raw)
    }

    /// Convert from raw TOML config to validated config
    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let routing: RoutingConfig = raw.routing.unwrap_or_default().into();
        let health = raw.health.unwrap_or_default().try_into()?;
        let logging = raw.logging.unwrap_or_default().into();

        let mut seen = HashSet::new();
        for account in &raw.accounts {
            if account.id.trim().is_empty() {
                return Err(ConfigError::Invalid("Account id must not be empty".to_string()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate account id: {}",
                    account.id
                )));
            }
        }

        for rule in &raw.rules {
            for pattern in [&rule.user_pattern, &rule.issuer_pattern].into_iter().flatten() {
                PatternMatcher::new(pattern).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            }
        }

        Ok(Self {
            routing,
            health,
            logging,
            accounts: raw.accounts,
            rules: raw.rules,
        })
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            routing: RoutingConfig::default(),
            health: HealthSettings::default(),
            logging: LoggingConfig::default(),
            accounts: vec![],
            rules: vec![],
        }
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gatekeeper")
            .join("config.toml")
    }

    /// Build mapper options; collaborators can be injected on the result
    pub fn into_options(self) -> MapperOptions {
        MapperOptions {
            accounts: self.accounts,
            rules: self.rules,
            default_account_id: self.routing.default_account,
            enable_health_monitoring: self.health.enabled,
            enable_failover: self.routing.enable_failover,
            enable_audit_logging: self.routing.enable_audit_logging,
            health: self.health.monitor,
            base_url: self.routing.base_url,
            organization: self.routing.organization,
            ..MapperOptions::default()
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Routing configuration
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Account used when no rule matches
    pub default_account: Option<String>,
    /// Walk fallback chains for unhealthy accounts
    pub enable_failover: bool,
    /// Emit audit events
    pub enable_audit_logging: bool,
    /// Base URL for accounts without one
    pub base_url: Option<String>,
    /// Organization for accounts without one
    pub organization: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_account: None,
            enable_failover: true,
            enable_audit_logging: true,
            base_url: None,
            organization: None,
        }
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone, Default)]
pub struct HealthSettings {
    /// Whether the mapper gates routing on health
    pub enabled: bool,
    /// Monitor settings
    pub monitor: HealthConfig,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Format: "json" or "pretty"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format
    Json,
}

/// Parse a boolean flag the way operators tend to write them
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
