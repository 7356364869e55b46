//! Raw configuration types for TOML parsing

use super::*;
use serde::Deserialize;
use std::time::Duration;

/// Raw configuration as parsed from TOML
#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub routing: Option<RawRoutingConfig>,
    pub health: Option<RawHealthConfig>,
    pub logging: Option<RawLoggingConfig>,
    #[serde(default)]
    pub accounts: Vec<ServiceAccount>,
    #[serde(default)]
    pub rules: Vec<MappingRule>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawRoutingConfig {
    pub default_account: Option<String>,
    pub failover: Option<bool>,
    pub audit: Option<bool>,
    pub base_url: Option<String>,
    pub organization: Option<String>,
}

impl From<RawRoutingConfig> for RoutingConfig {
    fn from(raw: RawRoutingConfig) -> Self {
        Self {
            default_account: raw.default_account,
            enable_failover: raw.failover.unwrap_or(true),
            enable_audit_logging: raw.audit.unwrap_or(true),
            base_url: raw.base_url,
            organization: raw.organization,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawHealthConfig {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_failures: Option<u32>,
    pub auto_start: Option<bool>,
    pub path: Option<String>,
}

impl TryFrom<RawHealthConfig> for HealthSettings {
    type Error = ConfigError;

    fn try_from(raw: RawHealthConfig) -> Result<Self, Self::Error> {
        let defaults = HealthConfig::default();

        if raw.max_failures == Some(0) {
            return Err(ConfigError::Invalid(
                "health.max_failures must be at least 1".to_string(),
            ));
        }
        if raw.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "health.timeout_secs must be at least 1".to_string(),
            ));
        }

        let health_path = match raw.path {
            Some(path) if !path.starts_with('/') => format!("/{}", path),
            Some(path) => path,
            None => defaults.health_path.clone(),
        };

        Ok(Self {
            enabled: raw.enabled.unwrap_or(false),
            monitor: HealthConfig {
                check_interval: raw
                    .interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.check_interval),
                timeout: raw
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
                max_failures: raw.max_failures.unwrap_or(defaults.max_failures),
                auto_start: raw.auto_start.unwrap_or(defaults.auto_start),
                health_path,
                ..defaults
            },
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl From<RawLoggingConfig> for LoggingConfig {
    fn from(raw: RawLoggingConfig) -> Self {
        Self {
            level: raw.level.unwrap_or_else(|| "info".to_string()),
            format: match raw.format.as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[routing]
default_account = "default"
failover = true
base_url = "https://api.analysis.example.com"
organization = "acme"

[health]
enabled = true
interval_secs = 30
timeout_secs = 2
max_failures = 5
path = "status"

[logging]
level = "debug"
format = "json"

[[accounts]]
id = "default"
name = "Default"
token = "t1"

[[accounts]]
id = "dev"
name = "Development"
token = "t2"
environment = "dev"
allowed_scopes = ["read"]
fallback_account_id = "default"

[[rules]]
priority = 1
user_pattern = "*@dev.example.com"
account_id = "dev"

[[rules]]
priority = 5
required_groups = ["analysts"]
account_id = "default"
"#;

        let config = RouterConfig::parse(toml).unwrap();
        assert_eq!(config.routing.default_account.as_deref(), Some("default"));
        assert!(config.health.enabled);
        assert_eq!(config.health.monitor.check_interval, Duration::from_secs(30));
        assert_eq!(config.health.monitor.timeout, Duration::from_secs(2));
        assert_eq!(config.health.monitor.max_failures, 5);
        assert_eq!(config.health.monitor.health_path, "/status");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[1].fallback_account_id.as_deref(), Some("default"));
        assert_eq!(config.rules.len(), 2);

        let options = config.into_options();
        assert_eq!(options.organization.as_deref(), Some("acme"));
        assert!(options.enable_health_monitoring);
    }

    #[test]
    fn test_minimal_config() {
        let config = RouterConfig::parse("").unwrap();
        assert!(config.accounts.is_empty());
        assert!(config.routing.enable_failover);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_duplicate_accounts() {
        let toml = r#"
[[accounts]]
id = "a"

[[accounts]]
id = "a"
"#;
        let err = RouterConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_rejects_zero_max_failures() {
        let err = RouterConfig::parse("[health]\nmax_failures = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = RouterConfig::parse("[[accounts]\nid = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
