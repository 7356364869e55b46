//! Service account health monitoring
//!
//! Tracks a per-account state machine (`unknown -> healthy <-> unhealthy`).
//! Accounts tolerate transient errors: an account only becomes unhealthy once
//! its consecutive failure count reaches `max_failures`.
//!
//! Probes are raced against a timeout so a hung endpoint resolves as a
//! failure instead of leaving the check pending.

mod probe;

pub use probe::{HttpProber, ProbeError, ProbeTarget, Prober};

use crate::ServiceAccount;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Shortest interval the periodic sweep will run at
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between periodic sweeps
    pub check_interval: Duration,
    /// Upper bound on a single probe
    pub timeout: Duration,
    /// Consecutive failures before an account is marked unhealthy
    pub max_failures: u32,
    /// Start the periodic sweep on construction
    pub auto_start: bool,
    /// Path probed relative to the account's base URL
    pub health_path: String,
    /// Base URL for accounts that do not set one
    pub default_base_url: Option<String>,
    /// Organization for accounts that do not set one
    pub default_organization: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            max_failures: 3,
            auto_start: true,
            health_path: "/health".to_string(),
            default_base_url: None,
            default_organization: None,
        }
    }
}

/// Coarse health state of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Health of a single service account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub account_id: String,
    pub is_healthy: bool,
    /// `None` until the first probe completes
    pub last_check: Option<DateTime<Utc>>,
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Option<Duration>,
    pub error: Option<String>,
    pub failure_count: u32,
}

impl HealthStatus {
    /// A never-checked, presumed healthy status
    pub fn unknown(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            is_healthy: true,
            last_check: None,
            latency: None,
            error: None,
            failure_count: 0,
        }
    }

    /// Status seeded from an account's configured health fields
    pub fn seeded(account: &ServiceAccount) -> Self {
        Self {
            is_healthy: account.is_healthy,
            failure_count: account.failure_count,
            ..Self::unknown(&account.id)
        }
    }

    pub fn state(&self) -> HealthState {
        match (self.last_check, self.is_healthy) {
            (None, _) => HealthState::Unknown,
            (Some(_), true) => HealthState::Healthy,
            (Some(_), false) => HealthState::Unhealthy,
        }
    }

    /// Count one failure and flip unhealthy at the threshold
    fn record_failure(&mut self, reason: String, max_failures: u32) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.error = Some(reason);
        if self.failure_count >= max_failures {
            self.is_healthy = false;
        }
    }

    fn record_success(&mut self, latency: Duration) {
        self.is_healthy = true;
        self.failure_count = 0;
        self.error = None;
        self.latency = Some(latency);
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Health operations the mapper depends on
///
/// Implemented by [`HealthMonitor`]; tests and multi-tenant setups can supply
/// their own.
#[async_trait]
pub trait AccountHealth: Send + Sync {
    /// Register an account and seed its status
    fn add_account(&self, account: &ServiceAccount);

    /// Replace a registered account, keeping its status
    fn update_account(&self, account: &ServiceAccount);

    /// Forget an account and its status
    fn remove_account(&self, account_id: &str);

    /// Probe one account; failures are reported in the returned status
    async fn check_account(
        &self,
        account: &ServiceAccount,
        fallback_url: Option<&str>,
        fallback_org: Option<&str>,
    ) -> HealthStatus;

    /// Probe every registered account concurrently
    async fn check_all_accounts(&self) -> HashMap<String, HealthStatus>;

    fn get_health(&self, account_id: &str) -> Option<HealthStatus>;

    fn get_all_health(&self) -> HashMap<String, HealthStatus>;

    fn mark_failed(&self, account_id: &str, reason: &str);

    fn reset_failures(&self, account_id: &str);

    /// Stop any background activity
    fn stop(&self);
}

/// State shared between the monitor and its sweep task
struct MonitorState {
    config: HealthConfig,
    prober: Arc<dyn Prober>,
    accounts: RwLock<HashMap<String, ServiceAccount>>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
}

impl MonitorState {
    async fn check_account(
        &self,
        account: &ServiceAccount,
        fallback_url: Option<&str>,
        fallback_org: Option<&str>,
    ) -> HealthStatus {
        let target = ProbeTarget {
            account_id: account.id.clone(),
            base_url: account
                .base_url
                .clone()
                .or_else(|| fallback_url.map(str::to_string))
                .or_else(|| self.config.default_base_url.clone()),
            organization: account
                .organization
                .clone()
                .or_else(|| fallback_org.map(str::to_string))
                .or_else(|| self.config.default_organization.clone()),
            token: account.token.clone(),
        };

        let started = Instant::now();
        let outcome = match timeout(self.config.timeout, self.prober.probe(&target)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.config.timeout)),
        };
        let elapsed = started.elapsed();

        // Only registered accounts are tracked; a status removed while the
        // probe was in flight stays removed
        let mut statuses = self.statuses.write();
        let mut detached = None;
        let status = match statuses.get_mut(&account.id) {
            Some(status) => status,
            None => detached.insert(HealthStatus::seeded(account)),
        };
        status.last_check = Some(Utc::now());

        match outcome {
            Ok(()) => {
                status.record_success(elapsed);
                debug!(
                    account_id = %account.id,
                    latency_ms = elapsed.as_millis() as u64,
                    "Health probe succeeded"
                );
            }
            Err(e) => {
                status.record_failure(e.to_string(), self.config.max_failures);
                warn!(
                    account_id = %account.id,
                    error = %e,
                    failure_count = status.failure_count,
                    healthy = status.is_healthy,
                    "Health probe failed"
                );
            }
        }

        status.clone()
    }

    async fn check_all_accounts(&self) -> HashMap<String, HealthStatus> {
        let accounts: Vec<ServiceAccount> = self.accounts.read().values().cloned().collect();

        let results = join_all(
            accounts
                .iter()
                .map(|account| self.check_account(account, None, None)),
        )
        .await;

        let healthy = results.iter().filter(|s| s.is_healthy).count();
        info!(
            total = results.len(),
            healthy,
            unhealthy = results.len() - healthy,
            "Health sweep complete"
        );

        results
            .into_iter()
            .map(|status| (status.account_id.clone(), status))
            .collect()
    }
}

/// Owns per-account health state and the periodic probe sweep
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor probing over HTTP
    pub fn new(config: HealthConfig) -> Result<Self, reqwest::Error> {
        let prober = HttpProber::new(config.health_path.clone())?;
        Ok(Self::with_prober(config, Arc::new(prober)))
    }

    /// Create a monitor with a custom prober
    pub fn with_prober(config: HealthConfig, prober: Arc<dyn Prober>) -> Self {
        let auto_start = config.auto_start;
        let monitor = Self {
            state: Arc::new(MonitorState {
                config,
                prober,
                accounts: RwLock::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
            }),
            sweep: Mutex::new(None),
        };

        if auto_start {
            monitor.start();
        }

        monitor
    }

    /// Register accounts in bulk
    pub fn with_accounts<'a>(self, accounts: impl IntoIterator<Item = &'a ServiceAccount>) -> Self {
        for account in accounts {
            self.add_account(account);
        }
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.state.config
    }

    pub fn add_account(&self, account: &ServiceAccount) {
        let mut accounts = self.state.accounts.write();
        let mut statuses = self.state.statuses.write();
        accounts.insert(account.id.clone(), account.clone());
        statuses.insert(account.id.clone(), HealthStatus::seeded(account));
    }

    pub fn update_account(&self, account: &ServiceAccount) {
        let mut accounts = self.state.accounts.write();
        if let Some(existing) = accounts.get_mut(&account.id) {
            *existing = account.clone();
            self.state
                .statuses
                .write()
                .entry(account.id.clone())
                .or_insert_with(|| HealthStatus::seeded(account));
        }
    }

    pub fn remove_account(&self, account_id: &str) {
        let mut accounts = self.state.accounts.write();
        let mut statuses = self.state.statuses.write();
        accounts.remove(account_id);
        statuses.remove(account_id);
    }

    /// Probe one account, bounded by the configured timeout
    ///
    /// The result is stored only while the account is registered. The probe
    /// sends `account.token`; periodic sweeps therefore use static tokens.
    pub async fn check_account(
        &self,
        account: &ServiceAccount,
        fallback_url: Option<&str>,
        fallback_org: Option<&str>,
    ) -> HealthStatus {
        self.state
            .check_account(account, fallback_url, fallback_org)
            .await
    }

    /// Probe every registered account; one failing probe never aborts the sweep
    pub async fn check_all_accounts(&self) -> HashMap<String, HealthStatus> {
        self.state.check_all_accounts().await
    }

    pub fn mark_failed(&self, account_id: &str, reason: &str) {
        let mut statuses = self.state.statuses.write();
        if let Some(status) = statuses.get_mut(account_id) {
            status.record_failure(reason.to_string(), self.state.config.max_failures);
            debug!(
                account_id = %account_id,
                failure_count = status.failure_count,
                healthy = status.is_healthy,
                "Marked account failure"
            );
        }
    }

    pub fn reset_failures(&self, account_id: &str) {
        let mut statuses = self.state.statuses.write();
        if let Some(status) = statuses.get_mut(account_id) {
            status.failure_count = 0;
            status.is_healthy = true;
            status.error = None;
        }
    }

    pub fn get_health(&self, account_id: &str) -> Option<HealthStatus> {
        self.state.statuses.read().get(account_id).cloned()
    }

    pub fn get_all_health(&self) -> HashMap<String, HealthStatus> {
        self.state.statuses.read().clone()
    }

    /// Arm the periodic sweep. Calling it while running does nothing.
    pub fn start(&self) {
        let mut sweep = self.sweep.lock();
        if sweep.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available; periodic health checks not started");
                return;
            }
        };

        let period = self.state.config.check_interval.max(MIN_CHECK_INTERVAL);
        let state = Arc::clone(&self.state);

        *sweep = Some(runtime.spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                state.check_all_accounts().await;
            }
        }));

        info!(interval_secs = period.as_secs(), "Started periodic health checks");
    }

    /// Disarm the periodic sweep. Calling it while stopped does nothing.
    pub fn stop(&self) {
        if let Some(task) = self.sweep.lock().take() {
            task.abort();
            info!("Stopped periodic health checks");
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweep
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.sweep.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl AccountHealth for HealthMonitor {
    fn add_account(&self, account: &ServiceAccount) {
        HealthMonitor::add_account(self, account)
    }

    fn update_account(&self, account: &ServiceAccount) {
        HealthMonitor::update_account(self, account)
    }

    fn remove_account(&self, account_id: &str) {
        HealthMonitor::remove_account(self, account_id)
    }

    async fn check_account(
        &self,
        account: &ServiceAccount,
        fallback_url: Option<&str>,
        fallback_org: Option<&str>,
    ) -> HealthStatus {
        HealthMonitor::check_account(self, account, fallback_url, fallback_org).await
    }

    async fn check_all_accounts(&self) -> HashMap<String, HealthStatus> {
        HealthMonitor::check_all_accounts(self).await
    }

    fn get_health(&self, account_id: &str) -> Option<HealthStatus> {
        HealthMonitor::get_health(self, account_id)
    }

    fn get_all_health(&self) -> HashMap<String, HealthStatus> {
        HealthMonitor::get_all_health(self)
    }

    fn mark_failed(&self, account_id: &str, reason: &str) {
        HealthMonitor::mark_failed(self, account_id, reason)
    }

    fn reset_failures(&self, account_id: &str) {
        HealthMonitor::reset_failures(self, account_id)
    }

    fn stop(&self) {
        HealthMonitor::stop(self)
    }
}
