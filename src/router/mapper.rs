//! Rule-based mapping of callers onto service accounts

use super::rules::{first_match, CompiledRule};
use super::{MappingRule, PatternError};
use crate::audit::{Auditor, TracingAuditor};
use crate::client::{ClientError, ClientFactory, PlatformClientFactory, DEFAULT_BASE_URL};
use crate::credentials::CredentialStore;
use crate::health::{AccountHealth, HealthConfig, HealthMonitor, HealthStatus, HttpProber, Prober};
use crate::{Claims, RouterError, Secret, ServiceAccount};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Construction options for a [`Mapper`]
///
/// Injected collaborators are always used. The `enable_*` flags decide
/// whether a default implementation is built when none is injected.
pub struct MapperOptions {
    pub accounts: Vec<ServiceAccount>,
    pub rules: Vec<MappingRule>,
    pub default_account_id: Option<String>,
    pub health_monitor: Option<Arc<dyn AccountHealth>>,
    pub auditor: Option<Arc<dyn Auditor>>,
    pub credential_store: Option<Arc<dyn CredentialStore>>,
    /// Build an HTTP health monitor when none is injected
    pub enable_health_monitoring: bool,
    /// Walk fallback chains when the selected account is unhealthy
    pub enable_failover: bool,
    /// Use the tracing auditor when none is injected
    pub enable_audit_logging: bool,
    /// Settings for a monitor built by the mapper
    pub health: HealthConfig,
    /// Prober for a monitor built by the mapper; HTTP when unset
    pub prober: Option<Arc<dyn Prober>>,
    /// Base URL for accounts that do not set one
    pub base_url: Option<String>,
    /// Organization for accounts that do not set one
    pub organization: Option<String>,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            rules: Vec::new(),
            default_account_id: None,
            health_monitor: None,
            auditor: None,
            credential_store: None,
            enable_health_monitoring: false,
            enable_failover: true,
            enable_audit_logging: true,
            health: HealthConfig::default(),
            prober: None,
            base_url: None,
            organization: None,
        }
    }
}

impl MapperOptions {
    pub fn with_account(mut self, account: ServiceAccount) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn with_rule(mut self, rule: MappingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_default_account(mut self, account_id: impl Into<String>) -> Self {
        self.default_account_id = Some(account_id.into());
        self
    }

    pub fn with_health_monitor(mut self, monitor: Arc<dyn AccountHealth>) -> Self {
        self.health_monitor = Some(monitor);
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn with_health_monitoring(mut self, enabled: bool) -> Self {
        self.enable_health_monitoring = enabled;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.enable_failover = enabled;
        self
    }
}

/// Result of a successful resolution
#[derive(Debug)]
pub struct Resolution<C> {
    /// Client ready to call the downstream platform
    pub client: C,
    /// Account the caller was routed to
    pub account_id: String,
    pub account_name: String,
}

/// A routing failure together with the account it concerned, if any
struct Denial {
    account_id: Option<String>,
    error: RouterError,
}

impl Denial {
    fn new(account_id: Option<&str>, error: RouterError) -> Self {
        Self {
            account_id: account_id.map(str::to_string),
            error,
        }
    }
}

/// Account chosen by the routing steps, before the client is built
struct Routed {
    account: ServiceAccount,
    token: Secret,
    detail: String,
}

/// Maps authenticated callers onto healthy service accounts
pub struct Mapper<F: ClientFactory = PlatformClientFactory> {
    accounts: RwLock<HashMap<String, ServiceAccount>>,
    rules: RwLock<Vec<CompiledRule>>,
    default_account_id: Option<String>,
    health: Option<Arc<dyn AccountHealth>>,
    auditor: Option<Arc<dyn Auditor>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    factory: F,
    enable_failover: bool,
    base_url: Option<String>,
    organization: Option<String>,
}

impl Mapper<PlatformClientFactory> {
    /// Create a mapper that builds [`crate::client::PlatformClient`]s
    pub fn new(options: MapperOptions) -> Result<Self, RouterError> {
        Self::with_factory(options, PlatformClientFactory::new())
    }

    /// Create a mapper from `GATEKEEPER_*` environment variables
    pub fn from_env() -> Result<Self, RouterError> {
        Self::new(crate::config::EnvBootstrap::from_env().into_options())
    }
}

impl<F: ClientFactory> Mapper<F> {
    /// Create a mapper with a custom client factory
    pub fn with_factory(options: MapperOptions, factory: F) -> Result<Self, RouterError> {
        let mut rules = options
            .rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        rules.sort_by_key(|r| r.rule.priority);

        let health: Option<Arc<dyn AccountHealth>> = match options.health_monitor {
            Some(monitor) => Some(monitor),
            None if options.enable_health_monitoring => {
                // Probe the endpoint the client factory would fall back to
                let config = HealthConfig {
                    default_base_url: options
                        .health
                        .default_base_url
                        .or_else(|| options.base_url.clone())
                        .or_else(|| Some(DEFAULT_BASE_URL.to_string())),
                    default_organization: options
                        .health
                        .default_organization
                        .or_else(|| options.organization.clone()),
                    ..options.health
                };
                let prober: Arc<dyn Prober> = match options.prober {
                    Some(prober) => prober,
                    None => Arc::new(
                        HttpProber::new(config.health_path.clone()).map_err(ClientError::from)?,
                    ),
                };
                Some(Arc::new(HealthMonitor::with_prober(config, prober)))
            }
            None => None,
        };

        let auditor: Option<Arc<dyn Auditor>> = match options.auditor {
            Some(auditor) => Some(auditor),
            None if options.enable_audit_logging => Some(Arc::new(TracingAuditor::new())),
            None => None,
        };

        let mut accounts = HashMap::new();
        for account in options.accounts {
            if let Some(health) = &health {
                health.add_account(&account);
            }
            accounts.insert(account.id.clone(), account);
        }

        info!(
            accounts = accounts.len(),
            rules = rules.len(),
            default_account = options.default_account_id.as_deref(),
            health_monitoring = health.is_some(),
            failover = options.enable_failover,
            "Mapper initialized"
        );

        Ok(Self {
            accounts: RwLock::new(accounts),
            rules: RwLock::new(rules),
            default_account_id: options.default_account_id,
            health,
            auditor,
            credentials: options.credential_store,
            factory,
            enable_failover: options.enable_failover,
            base_url: options.base_url,
            organization: options.organization,
        })
    }

    /// Route a caller to a service account and build its client
    ///
    /// Every failure is audited as a denial before the error is returned.
    pub async fn resolve(&self, claims: &Claims) -> Result<Resolution<F::Client>, RouterError> {
        let span = info_span!(
            "resolve",
            resolution_id = %Uuid::new_v4(),
            subject = %claims.subject()
        );

        async move {
            let outcome = match self.route(claims).await {
                Ok(routed) => self.build(routed).map_err(|(account_id, e)| {
                    Denial::new(Some(&account_id), RouterError::Client(e))
                }),
                Err(denial) => Err(denial),
            };

            match outcome {
                Ok((resolution, detail)) => {
                    self.audit_access(claims, &resolution, &detail).await;
                    debug!(account_id = %resolution.account_id, "Resolved service account");
                    Ok(resolution)
                }
                Err(denial) => {
                    self.audit_denied(claims, denial.account_id.as_deref(), &denial.error)
                        .await;
                    Err(denial.error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Pick an account, gate it on health and resolve its token
    async fn route(&self, claims: &Claims) -> Result<Routed, Denial> {
        let (candidate, mut detail) = self.select_candidate(claims).ok_or_else(|| {
            Denial::new(
                None,
                RouterError::NoMapping {
                    subject: claims.subject().to_string(),
                },
            )
        })?;

        let account = self.account(&candidate).ok_or_else(|| {
            Denial::new(
                Some(&candidate),
                RouterError::AccountNotFound(candidate.clone()),
            )
        })?;

        let (account, token) = self.select_healthy(claims, account).await?;
        if account.id != candidate {
            detail = format!("{}; failover from {}", detail, candidate);
        }

        let token = token.ok_or_else(|| {
            Denial::new(Some(&account.id), RouterError::NoToken(account.id.clone()))
        })?;

        Ok(Routed {
            account,
            token,
            detail,
        })
    }

    fn build(
        &self,
        routed: Routed,
    ) -> Result<(Resolution<F::Client>, String), (String, ClientError)> {
        let Routed {
            account,
            token,
            detail,
        } = routed;

        let base_url = account.base_url.as_deref().or(self.base_url.as_deref());
        let organization = account
            .organization
            .as_deref()
            .or(self.organization.as_deref());

        match self.factory.create(&token, base_url, organization) {
            Ok(client) => Ok((
                Resolution {
                    client,
                    account_name: account.display_name().to_string(),
                    account_id: account.id,
                },
                detail,
            )),
            Err(e) => Err((account.id, e)),
        }
    }

    /// First matching rule's target, else the default account
    fn select_candidate(&self, claims: &Claims) -> Option<(String, String)> {
        let rules = self.rules.read();
        if let Some(rule) = first_match(&rules, claims) {
            let detail = match &rule.description {
                Some(description) => format!("rule priority {} ({})", rule.priority, description),
                None => format!("rule priority {}", rule.priority),
            };
            return Some((rule.account_id.clone(), detail));
        }

        self.default_account_id
            .clone()
            .map(|id| (id, "default account".to_string()))
    }

    /// Walk the fallback chain until a healthy account is found
    ///
    /// Each account is probed with the same secret its client would use.
    async fn select_healthy(
        &self,
        claims: &Claims,
        candidate: ServiceAccount,
    ) -> Result<(ServiceAccount, Option<Secret>), Denial> {
        let Some(health) = &self.health else {
            let token = self.resolve_token(&candidate).await;
            return Ok((candidate, token));
        };

        let origin = candidate.id.clone();
        let mut current = candidate;
        let mut visited = HashSet::new();
        let mut chain = Vec::new();

        loop {
            visited.insert(current.id.clone());
            chain.push(current.id.clone());

            let token = self.resolve_token(&current).await;
            let probed = ServiceAccount {
                token: token.clone(),
                ..current.clone()
            };
            let status = health
                .check_account(&probed, self.base_url.as_deref(), self.organization.as_deref())
                .await;
            if status.is_healthy {
                return Ok((current, token));
            }

            let reason = status
                .error
                .clone()
                .unwrap_or_else(|| "marked unhealthy".to_string());

            if !self.enable_failover {
                return Err(Denial::new(
                    Some(&origin),
                    RouterError::HealthCheckFailed {
                        account_id: current.id,
                        reason,
                    },
                ));
            }

            let Some(next_id) = current.fallback_account_id.clone() else {
                return Err(Denial::new(
                    Some(&origin),
                    RouterError::AllAccountsFailed { chain },
                ));
            };

            if visited.contains(&next_id) {
                warn!(account_id = %current.id, fallback = %next_id, "Fallback cycle detected");
                chain.push(next_id);
                return Err(Denial::new(
                    Some(&origin),
                    RouterError::AllAccountsFailed { chain },
                ));
            }

            let Some(next) = self.account(&next_id) else {
                warn!(account_id = %current.id, fallback = %next_id, "Fallback account not found");
                chain.push(next_id);
                return Err(Denial::new(
                    Some(&origin),
                    RouterError::AllAccountsFailed { chain },
                ));
            };

            self.audit_failover(&current.id, &next.id, &reason, claims.subject())
                .await;
            current = next;
        }
    }

    /// Credential store first, then the account's static token
    async fn resolve_token(&self, account: &ServiceAccount) -> Option<Secret> {
        if let Some(store) = &self.credentials {
            let key = account.credential_key();
            if store.has_credential(key).await {
                match store.get_credential(key).await {
                    Some(secret) if !secret.is_blank() => return Some(secret),
                    _ => debug!(
                        account_id = %account.id,
                        "Credential store returned no value; using static token"
                    ),
                }
            }
        }

        account.token.clone().filter(|t| !t.is_blank())
    }

    fn account(&self, id: &str) -> Option<ServiceAccount> {
        self.accounts.read().get(id).cloned()
    }

    /// Add a rule; the list stays sorted by priority, ties in insertion order
    pub fn add_rule(&self, rule: MappingRule) -> Result<(), PatternError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self.rules.write();
        rules.push(compiled);
        rules.sort_by_key(|r| r.rule.priority);
        Ok(())
    }

    /// Insert an account, replacing any account with the same id
    pub fn add_account(&self, account: ServiceAccount) {
        let mut accounts = self.accounts.write();
        if let Some(health) = &self.health {
            if accounts.contains_key(&account.id) {
                health.update_account(&account);
            } else {
                health.add_account(&account);
            }
        }
        info!(account_id = %account.id, "Service account registered");
        accounts.insert(account.id.clone(), account);
    }

    /// Remove an account; rules and fallbacks referencing it are left as-is
    pub fn remove_account(&self, account_id: &str) -> Option<ServiceAccount> {
        let removed = self.accounts.write().remove(account_id);
        if removed.is_some() {
            if let Some(health) = &self.health {
                health.remove_account(account_id);
            }
            info!(account_id = %account_id, "Service account removed");
        }
        removed
    }

    /// Snapshot of registered accounts, ordered by id
    pub fn list_accounts(&self) -> Vec<ServiceAccount> {
        let mut accounts: Vec<_> = self.accounts.read().values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    /// Snapshot of rules in evaluation order
    pub fn list_rules(&self) -> Vec<MappingRule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    pub fn default_account_id(&self) -> Option<&str> {
        self.default_account_id.as_deref()
    }

    /// Probe every account and audit each result
    pub async fn check_all_accounts_health(
        &self,
    ) -> Result<HashMap<String, HealthStatus>, RouterError> {
        let Some(health) = &self.health else {
            debug!("Health monitoring disabled; skipping health check");
            return Ok(HashMap::new());
        };

        let results = health.check_all_accounts().await;
        for (account_id, status) in &results {
            if let Some(auditor) = &self.auditor {
                if let Err(e) = auditor.log_health_check(account_id, status).await {
                    warn!(account_id = %account_id, error = %e, "Failed to audit health check");
                }
            }
        }

        Ok(results)
    }

    pub fn health_monitor(&self) -> Option<&Arc<dyn AccountHealth>> {
        self.health.as_ref()
    }

    pub fn auditor(&self) -> Option<&Arc<dyn Auditor>> {
        self.auditor.as_ref()
    }

    /// Stop background health checks. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if let Some(health) = &self.health {
            health.stop();
        }
    }

    async fn audit_access(&self, claims: &Claims, resolution: &Resolution<F::Client>, detail: &str) {
        if let Some(auditor) = &self.auditor {
            if let Err(e) = auditor
                .log_access(
                    claims,
                    &resolution.account_id,
                    &resolution.account_name,
                    Some(detail),
                )
                .await
            {
                warn!(error = %e, "Failed to audit access");
            }
        }
    }

    async fn audit_denied(&self, claims: &Claims, account_id: Option<&str>, error: &RouterError) {
        if let Some(auditor) = &self.auditor {
            if let Err(e) = auditor
                .log_access_denied(claims, account_id, &error.to_string())
                .await
            {
                warn!(error = %e, "Failed to audit access denial");
            }
        }
    }

    async fn audit_failover(&self, from: &str, to: &str, reason: &str, subject: &str) {
        info!(from = %from, to = %to, reason = %reason, "Failing over to fallback account");
        if let Some(auditor) = &self.auditor {
            if let Err(e) = auditor.log_failover(from, to, reason, subject).await {
                warn!(error = %e, "Failed to audit failover");
            }
        }
    }
}
