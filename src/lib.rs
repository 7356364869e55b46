//! Gatekeeper - access routing for an API gateway
//!
//! Gatekeeper multiplexes many authenticated callers onto a small set of
//! backend service accounts. For every request it picks an account from an
//! ordered rule list, checks that the account is healthy, fails over along
//! the configured fallback chain when it is not, and records an audit trail
//! of the decision.

pub mod audit;
pub mod client;
pub mod config;
pub mod credentials;
pub mod health;
pub mod logging;
pub mod router;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Placeholder used in diagnostics when a caller has no `sub` claim
const ANONYMOUS_SUBJECT: &str = "<anonymous>";

/// Core error type returned by routing operations
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No mapping found for subject '{subject}'")]
    NoMapping { subject: String },

    #[error("Service account not found: {0}")]
    AccountNotFound(String),

    #[error("Health check failed for service account '{account_id}': {reason}")]
    HealthCheckFailed { account_id: String, reason: String },

    #[error("All service accounts failed (chain: {})", .chain.join(" -> "))]
    AllAccountsFailed { chain: Vec<String> },

    #[error("No token available for service account '{0}'")]
    NoToken(String),

    #[error("Client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] router::PatternError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Broad classification of a [`RouterError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operator mistake: missing account, missing token, bad pattern
    Configuration,
    /// No rule matched and no default account is configured
    Mapping,
    /// The selected account (and its fallbacks) are unhealthy
    Health,
}

impl RouterError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::NoMapping { .. } => ErrorKind::Mapping,
            RouterError::HealthCheckFailed { .. } | RouterError::AllAccountsFailed { .. } => {
                ErrorKind::Health
            }
            RouterError::AccountNotFound(_)
            | RouterError::NoToken(_)
            | RouterError::Client(_)
            | RouterError::Pattern(_)
            | RouterError::Config(_) => ErrorKind::Configuration,
        }
    }
}

/// A secret string that never shows up in `Debug` output
#[derive(Debug, Clone)]
pub struct Secret(SecretString);

impl Secret {
    /// Create a new secret from a string
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret value
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the secret holds only whitespace or nothing at all
    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// Validated attributes of an authenticated caller's token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (usually a user id or email)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Space-delimited scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Group memberships; accepts a single string or an array
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub groups: Option<Vec<String>>,
    /// Any other claims carried by the token
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    /// Create claims for a subject
    pub fn for_subject(sub: impl Into<String>) -> Self {
        Self {
            sub: Some(sub.into()),
            ..Default::default()
        }
    }

    /// Set the issuer
    pub fn with_issuer(mut self, iss: impl Into<String>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// Set the space-delimited scope claim
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the groups claim
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    /// Iterate over the individual scopes
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.as_deref().unwrap_or_default().split_whitespace()
    }

    /// Subject for diagnostics, falling back to a placeholder
    pub fn subject(&self) -> &str {
        self.sub.as_deref().unwrap_or(ANONYMOUS_SUBJECT)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(group)) => Some(vec![group]),
        Some(OneOrMany::Many(groups)) => Some(groups),
        None => None,
    })
}

fn default_true() -> bool {
    true
}

/// A backend credential set used to call the downstream platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Unique, stable identifier
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Static token (never serialized)
    #[serde(default, skip_serializing)]
    pub token: Option<Secret>,
    /// Key to look up in the credential store (defaults to `id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    /// Downstream base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Tenant / organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Scopes this account is allowed to use downstream
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_scopes: Vec<String>,
    /// Environment label (e.g. "prod", "dev")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Account to try when this one is unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_account_id: Option<String>,
    /// Seed health state
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    /// Seed failure count
    #[serde(default)]
    pub failure_count: u32,
}

impl ServiceAccount {
    /// Create a healthy account with no credential
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            token: None,
            credential_ref: None,
            base_url: None,
            organization: None,
            allowed_scopes: Vec::new(),
            environment: None,
            fallback_account_id: None,
            is_healthy: true,
            failure_count: 0,
        }
    }

    pub fn with_token(mut self, token: impl Into<Secret>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_credential_ref(mut self, key: impl Into<String>) -> Self {
        self.credential_ref = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn with_allowed_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn with_fallback(mut self, account_id: impl Into<String>) -> Self {
        self.fallback_account_id = Some(account_id.into());
        self
    }

    /// Name for display, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Key used when asking the credential store for this account's secret
    pub fn credential_key(&self) -> &str {
        self.credential_ref.as_deref().unwrap_or(&self.id)
    }
}
