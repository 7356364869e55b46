//! Account discovery from `GATEKEEPER_*` environment variables
//!
//! ```text
//! GATEKEEPER_TOKEN                 token of the "default" account
//! GATEKEEPER_NAME                  its display name
//! GATEKEEPER_DEFAULT_ACCOUNT       default account id override
//! GATEKEEPER_BASE_URL              base URL for accounts without one
//! GATEKEEPER_ORGANIZATION          organization for accounts without one
//! GATEKEEPER_ACCOUNT_<N>_TOKEN     required for slot N to exist
//! GATEKEEPER_ACCOUNT_<N>_ID        defaults to "account-<N>"
//! GATEKEEPER_ACCOUNT_<N>_NAME / _URL / _ORG / _SCOPES / _ENV / _FALLBACK
//! GATEKEEPER_HEALTH_CHECKS / _FAILOVER / _AUDIT          boolean flags
//! GATEKEEPER_HEALTH_INTERVAL_SECS / _TIMEOUT_SECS / _MAX_FAILURES / _PATH
//! ```
//!
//! Bootstrap never fails: malformed or partial entries are skipped with a log
//! line.

use super::parse_bool;
use crate::router::MapperOptions;
use crate::{Secret, ServiceAccount};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const PREFIX: &str = "GATEKEEPER_";
const ACCOUNT_PREFIX: &str = "GATEKEEPER_ACCOUNT_";

/// Id of the account created from `GATEKEEPER_TOKEN`
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Snapshot of `GATEKEEPER_*` variables
#[derive(Debug, Clone, Default)]
pub struct EnvBootstrap {
    vars: HashMap<String, String>,
}

impl EnvBootstrap {
    /// Read the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Self { vars }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(&format!("{}{}", PREFIX, key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(raw) => parse_bool(raw).unwrap_or_else(|| {
                warn!(var = %format!("{}{}", PREFIX, key), value = %raw, "Ignoring invalid boolean");
                default
            }),
            None => default,
        }
    }

    fn number<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(var = %format!("{}{}", PREFIX, key), value = %raw, "Ignoring invalid number");
                None
            }
        }
    }

    /// Satellite slot fields keyed by slot number
    fn slots(&self) -> BTreeMap<u32, HashMap<&str, &str>> {
        let mut slots: BTreeMap<u32, HashMap<&str, &str>> = BTreeMap::new();

        for (key, value) in &self.vars {
            let Some(rest) = key.strip_prefix(ACCOUNT_PREFIX) else {
                continue;
            };
            let Some((slot, field)) = rest.split_once('_') else {
                continue;
            };
            let Ok(slot) = slot.parse::<u32>() else {
                debug!(var = %key, "Ignoring malformed account variable");
                continue;
            };
            if slot == 0 {
                continue;
            }
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            slots.entry(slot).or_default().insert(field, value);
        }

        slots
    }

    /// Accounts described by the environment, default account first
    pub fn accounts(&self) -> Vec<ServiceAccount> {
        let mut accounts: Vec<ServiceAccount> = Vec::new();

        if let Some(token) = self.get("TOKEN") {
            let name = self.get("NAME").unwrap_or("Default");
            accounts.push(ServiceAccount::new(DEFAULT_ACCOUNT_ID, name).with_token(token));
        }

        for (slot, fields) in self.slots() {
            let Some(token) = fields.get("TOKEN") else {
                debug!(slot, "Skipping account slot without a token");
                continue;
            };

            let id = fields
                .get("ID")
                .map(|id| id.to_string())
                .unwrap_or_else(|| format!("account-{}", slot));

            let mut account = ServiceAccount::new(&id, fields.get("NAME").copied().unwrap_or(&id));
            account.token = Some(Secret::new(*token));
            account.base_url = fields.get("URL").map(|v| v.to_string());
            account.organization = fields.get("ORG").map(|v| v.to_string());
            account.environment = fields.get("ENV").map(|v| v.to_string());
            account.fallback_account_id = fields.get("FALLBACK").map(|v| v.to_string());
            account.allowed_scopes = fields
                .get("SCOPES")
                .map(|scopes| {
                    scopes
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            if let Some(existing) = accounts.iter_mut().find(|a| a.id == account.id) {
                warn!(slot, account_id = %account.id, "Account id defined twice; later slot wins");
                *existing = account;
            } else {
                accounts.push(account);
            }
        }

        accounts
    }

    /// Explicit override, else the default account when its token is set
    pub fn default_account_id(&self) -> Option<String> {
        self.get("DEFAULT_ACCOUNT")
            .map(str::to_string)
            .or_else(|| self.get("TOKEN").map(|_| DEFAULT_ACCOUNT_ID.to_string()))
    }

    /// Mapper options described by the environment
    pub fn into_options(self) -> MapperOptions {
        let mut options = MapperOptions {
            accounts: self.accounts(),
            default_account_id: self.default_account_id(),
            enable_health_monitoring: self.flag("HEALTH_CHECKS", false),
            enable_failover: self.flag("FAILOVER", true),
            enable_audit_logging: self.flag("AUDIT", true),
            base_url: self.get("BASE_URL").map(str::to_string),
            organization: self.get("ORGANIZATION").map(str::to_string),
            ..MapperOptions::default()
        };

        if let Some(secs) = self.number::<u64>("HEALTH_INTERVAL_SECS") {
            options.health.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.number::<u64>("HEALTH_TIMEOUT_SECS") {
            options.health.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(max) = self.number::<u32>("HEALTH_MAX_FAILURES") {
            options.health.max_failures = max.max(1);
        }
        if let Some(path) = self.get("HEALTH_PATH") {
            options.health.health_path = path.to_string();
        }

        info!(
            accounts = options.accounts.len(),
            default_account = options.default_account_id.as_deref(),
            "Loaded service accounts from environment"
        );

        options
    }
}
