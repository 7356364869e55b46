//! Integration tests for the routing core
//!
//! Tests the full flow: rules -> health gating -> failover -> credentials -> audit

use async_trait::async_trait;
use gatekeeper::audit::{AuditError, Auditor};
use gatekeeper::client::{ClientError, ClientFactory, DEFAULT_BASE_URL};
use gatekeeper::credentials::{CredentialStore, MemoryCredentialStore};
use gatekeeper::health::{HealthConfig, HealthMonitor, HealthStatus, ProbeError, ProbeTarget, Prober};
use gatekeeper::router::{Mapper, MapperOptions, MappingRule};
use gatekeeper::{Claims, ErrorKind, RouterError, Secret, ServiceAccount};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum AuditEvent {
    Access {
        account_id: String,
        detail: Option<String>,
    },
    Denied {
        account_id: Option<String>,
        reason: String,
    },
    Failover {
        from: String,
        to: String,
        subject: String,
    },
    HealthCheck {
        account_id: String,
        healthy: bool,
    },
}

#[derive(Default)]
struct RecordingAuditor {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditor {
    fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Auditor for RecordingAuditor {
    async fn log_access(
        &self,
        _claims: &Claims,
        account_id: &str,
        _account_name: &str,
        detail: Option<&str>,
    ) -> Result<(), AuditError> {
        self.events.lock().push(AuditEvent::Access {
            account_id: account_id.to_string(),
            detail: detail.map(str::to_string),
        });
        Ok(())
    }

    async fn log_access_denied(
        &self,
        _claims: &Claims,
        account_id: Option<&str>,
        reason: &str,
    ) -> Result<(), AuditError> {
        self.events.lock().push(AuditEvent::Denied {
            account_id: account_id.map(str::to_string),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn log_failover(
        &self,
        from_account: &str,
        to_account: &str,
        _reason: &str,
        subject: &str,
    ) -> Result<(), AuditError> {
        self.events.lock().push(AuditEvent::Failover {
            from: from_account.to_string(),
            to: to_account.to_string(),
            subject: subject.to_string(),
        });
        Ok(())
    }

    async fn log_health_check(
        &self,
        account_id: &str,
        status: &HealthStatus,
    ) -> Result<(), AuditError> {
        self.events.lock().push(AuditEvent::HealthCheck {
            account_id: account_id.to_string(),
            healthy: status.is_healthy,
        });
        Ok(())
    }
}

/// Auditor whose sink is always down
struct BrokenAuditor;

#[async_trait]
impl Auditor for BrokenAuditor {
    async fn log_access(
        &self,
        _: &Claims,
        _: &str,
        _: &str,
        _: Option<&str>,
    ) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("sink down".to_string()))
    }

    async fn log_access_denied(
        &self,
        _: &Claims,
        _: Option<&str>,
        _: &str,
    ) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("sink down".to_string()))
    }

    async fn log_failover(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("sink down".to_string()))
    }

    async fn log_health_check(&self, _: &str, _: &HealthStatus) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("sink down".to_string()))
    }
}

/// Client that records what it was built from
#[derive(Debug)]
struct FakeClient {
    token: String,
    base_url: Option<String>,
    organization: Option<String>,
}

#[derive(Default)]
struct FakeFactory {
    fail: bool,
}

impl ClientFactory for FakeFactory {
    type Client = FakeClient;

    fn create(
        &self,
        token: &Secret,
        base_url: Option<&str>,
        organization: Option<&str>,
    ) -> Result<FakeClient, ClientError> {
        if self.fail {
            return Err(ClientError::InvalidHeader("Authorization"));
        }
        Ok(FakeClient {
            token: token.expose().to_string(),
            base_url: base_url.map(str::to_string),
            organization: organization.map(str::to_string),
        })
    }
}

#[derive(Default)]
struct ScriptedProber {
    failing: Mutex<HashSet<String>>,
}

impl ScriptedProber {
    fn failing(ids: &[&str]) -> Arc<Self> {
        let prober = Self::default();
        prober
            .failing
            .lock()
            .extend(ids.iter().map(|id| id.to_string()));
        Arc::new(prober)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        if self.failing.lock().contains(&target.account_id) {
            Err(ProbeError::Status(503))
        } else {
            Ok(())
        }
    }
}

/// Prober that records each target and, like the HTTP prober, fails
/// targets without an endpoint
#[derive(Default)]
struct RecordingProber {
    targets: Mutex<Vec<ProbeTarget>>,
}

impl RecordingProber {
    fn targets(&self) -> Vec<ProbeTarget> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl Prober for RecordingProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        self.targets.lock().push(target.clone());
        match target.base_url {
            Some(_) => Ok(()),
            None => Err(ProbeError::NoEndpoint),
        }
    }
}

fn built_in_health(options: MapperOptions, prober: Arc<RecordingProber>) -> MapperOptions {
    let mut options = options.with_health_monitoring(true).with_prober(prober);
    options.health.max_failures = 1;
    options.health.auto_start = false;
    options
}

fn monitor(prober: Arc<ScriptedProber>, max_failures: u32) -> Arc<HealthMonitor> {
    Arc::new(HealthMonitor::with_prober(
        HealthConfig {
            max_failures,
            auto_start: false,
            ..Default::default()
        },
        prober,
    ))
}

fn account(id: &str) -> ServiceAccount {
    ServiceAccount::new(id, id.to_uppercase()).with_token(format!("token-{}", id))
}

fn build_mapper(options: MapperOptions) -> (Mapper<FakeFactory>, Arc<RecordingAuditor>) {
    let auditor = Arc::new(RecordingAuditor::default());
    let mapper = Mapper::with_factory(options.with_auditor(auditor.clone()), FakeFactory::default())
        .unwrap();
    (mapper, auditor)
}

/// The single default account serves everyone
#[tokio::test]
async fn test_default_account_only() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(ServiceAccount::new("default", "Default").with_token("t1"))
            .with_default_account("default"),
    );

    let resolution = mapper.resolve(&Claims::for_subject("a@b.com")).await.unwrap();
    assert_eq!(resolution.account_id, "default");
    assert_eq!(resolution.account_name, "Default");
    assert_eq!(resolution.client.token, "t1");

    assert_eq!(
        auditor.events(),
        vec![AuditEvent::Access {
            account_id: "default".to_string(),
            detail: Some("default account".to_string()),
        }]
    );
}

/// A user-pattern rule routes matching subjects, others fall back to default
#[tokio::test]
async fn test_rule_match_and_default_fallback() {
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("default"))
            .with_account(account("dev"))
            .with_rule(MappingRule::new(1, "dev").with_user_pattern("*@dev.example.com"))
            .with_default_account("default"),
    );

    let dev = mapper
        .resolve(&Claims::for_subject("x@dev.example.com"))
        .await
        .unwrap();
    assert_eq!(dev.account_id, "dev");

    let other = mapper.resolve(&Claims::for_subject("x@other.com")).await.unwrap();
    assert_eq!(other.account_id, "default");
}

/// Nothing configured at all is a mapping error, audited without an account
#[tokio::test]
async fn test_no_mapping_found() {
    let (mapper, auditor) = build_mapper(MapperOptions::default());

    let err = mapper.resolve(&Claims::for_subject("a@b.com")).await.unwrap_err();
    assert!(matches!(err, RouterError::NoMapping { .. }));
    assert_eq!(err.kind(), ErrorKind::Mapping);

    assert_eq!(
        auditor.events(),
        vec![AuditEvent::Denied {
            account_id: None,
            reason: "No mapping found for subject 'a@b.com'".to_string(),
        }]
    );
}

/// Lower priority wins regardless of insertion order; ties keep insertion order
#[tokio::test]
async fn test_priority_ordering() {
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("low"))
            .with_account(account("high"))
            .with_account(account("second")),
    );

    mapper
        .add_rule(MappingRule::new(10, "low").with_user_pattern("*@corp.com"))
        .unwrap();
    mapper
        .add_rule(MappingRule::new(1, "high").with_user_pattern("*@corp.com"))
        .unwrap();
    mapper
        .add_rule(MappingRule::new(1, "second").with_user_pattern("*@corp.com"))
        .unwrap();

    let resolution = mapper.resolve(&Claims::for_subject("a@corp.com")).await.unwrap();
    assert_eq!(resolution.account_id, "high");

    let order: Vec<_> = mapper
        .list_rules()
        .into_iter()
        .map(|r| r.account_id)
        .collect();
    assert_eq!(order, vec!["high", "second", "low"]);
}

/// Group and scope conditions are conjunctive; a missing groups claim never matches
#[tokio::test]
async fn test_scope_and_group_conditions() {
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("default"))
            .with_account(account("analysts"))
            .with_rule(
                MappingRule::new(1, "analysts")
                    .with_issuer_pattern("https://idp.example.com/*")
                    .with_required_scopes(["analysis:read"])
                    .with_required_groups(["analysts"]),
            )
            .with_default_account("default"),
    );

    let full = Claims::for_subject("u")
        .with_issuer("https://idp.example.com/realm")
        .with_scope("openid analysis:read")
        .with_groups(["analysts", "staff"]);
    assert_eq!(mapper.resolve(&full).await.unwrap().account_id, "analysts");

    let no_groups = Claims::for_subject("u")
        .with_issuer("https://idp.example.com/realm")
        .with_scope("openid analysis:read");
    assert_eq!(mapper.resolve(&no_groups).await.unwrap().account_id, "default");

    let missing_scope = full.clone().with_scope("openid");
    assert_eq!(mapper.resolve(&missing_scope).await.unwrap().account_id, "default");
}

/// A rule pointing at an unknown account is surfaced, never skipped
#[tokio::test]
async fn test_account_not_found() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(account("default"))
            .with_rule(MappingRule::new(1, "ghost"))
            .with_default_account("default"),
    );

    let err = mapper.resolve(&Claims::for_subject("a")).await.unwrap_err();
    assert!(matches!(err, RouterError::AccountNotFound(ref id) if id == "ghost"));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(matches!(
        auditor.events().as_slice(),
        [AuditEvent::Denied { account_id: Some(id), .. }] if id == "ghost"
    ));
}

/// Removing an account leaves rules in place, so they now fail loudly
#[tokio::test]
async fn test_remove_account_leaves_dangling_rule() {
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("dev"))
            .with_rule(MappingRule::new(1, "dev")),
    );

    assert!(mapper.resolve(&Claims::for_subject("a")).await.is_ok());
    assert!(mapper.remove_account("dev").is_some());
    assert!(mapper.remove_account("dev").is_none());
    assert_eq!(mapper.list_rules().len(), 1);

    let err = mapper.resolve(&Claims::for_subject("a")).await.unwrap_err();
    assert!(matches!(err, RouterError::AccountNotFound(_)));
}

/// Unhealthy primary fails over to its healthy fallback, with the hop audited
#[tokio::test]
async fn test_failover_to_healthy_fallback() {
    let health = monitor(ScriptedProber::failing(&["a"]), 1);
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(account("a").with_fallback("b"))
            .with_account(account("b"))
            .with_default_account("a")
            .with_health_monitor(health.clone()),
    );

    let resolution = mapper.resolve(&Claims::for_subject("x@y.com")).await.unwrap();
    assert_eq!(resolution.account_id, "b");
    assert_eq!(resolution.client.token, "token-b");

    assert_eq!(
        auditor.events(),
        vec![
            AuditEvent::Failover {
                from: "a".to_string(),
                to: "b".to_string(),
                subject: "x@y.com".to_string(),
            },
            AuditEvent::Access {
                account_id: "b".to_string(),
                detail: Some("default account; failover from a".to_string()),
            },
        ]
    );
    assert!(!health.get_health("a").unwrap().is_healthy);
    assert!(health.get_health("b").unwrap().is_healthy);
}

/// A -> B -> A with both unhealthy terminates with the whole chain reported
#[tokio::test]
async fn test_fallback_cycle_terminates() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(account("a").with_fallback("b"))
            .with_account(account("b").with_fallback("a"))
            .with_default_account("a")
            .with_health_monitor(monitor(ScriptedProber::failing(&["a", "b"]), 1)),
    );

    let err = mapper.resolve(&Claims::for_subject("x")).await.unwrap_err();
    match &err {
        RouterError::AllAccountsFailed { chain } => assert_eq!(chain, &["a", "b", "a"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Health);

    let events = auditor.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], AuditEvent::Failover { from, to, .. } if from == "a" && to == "b"));
    assert!(matches!(
        &events[1],
        AuditEvent::Denied { account_id: Some(id), reason }
            if id == "a" && reason.contains("a -> b -> a")
    ));
}

/// End of chain and dangling fallback ids both exhaust the chain
#[tokio::test]
async fn test_chain_exhaustion() {
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("solo"))
            .with_account(account("dangling").with_fallback("missing"))
            .with_rule(MappingRule::new(1, "dangling").with_user_pattern("d@*"))
            .with_default_account("solo")
            .with_health_monitor(monitor(ScriptedProber::failing(&["solo", "dangling"]), 1)),
    );

    let err = mapper.resolve(&Claims::for_subject("s@x")).await.unwrap_err();
    assert!(matches!(err, RouterError::AllAccountsFailed { ref chain } if chain == &["solo"]));

    let err = mapper.resolve(&Claims::for_subject("d@x")).await.unwrap_err();
    assert!(
        matches!(err, RouterError::AllAccountsFailed { ref chain } if chain == &["dangling", "missing"])
    );
}

/// With failover disabled an unhealthy account is a hard failure
#[tokio::test]
async fn test_unhealthy_without_failover() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(account("a").with_fallback("b"))
            .with_account(account("b"))
            .with_default_account("a")
            .with_failover(false)
            .with_health_monitor(monitor(ScriptedProber::failing(&["a"]), 1)),
    );

    let err = mapper.resolve(&Claims::for_subject("x")).await.unwrap_err();
    assert!(matches!(err, RouterError::HealthCheckFailed { ref account_id, .. } if account_id == "a"));
    assert!(matches!(
        auditor.events().as_slice(),
        [AuditEvent::Denied { .. }]
    ));
}

/// A single failed probe is tolerated until max_failures is reached
#[tokio::test]
async fn test_transient_failures_tolerated() {
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("a").with_fallback("b"))
            .with_account(account("b"))
            .with_default_account("a")
            .with_health_monitor(monitor(ScriptedProber::failing(&["a"]), 3)),
    );

    let claims = Claims::for_subject("x");
    assert_eq!(mapper.resolve(&claims).await.unwrap().account_id, "a");
    assert_eq!(mapper.resolve(&claims).await.unwrap().account_id, "a");
    assert_eq!(mapper.resolve(&claims).await.unwrap().account_id, "b");
}

/// Credential store wins; a store that claims a key but returns nothing falls back
#[tokio::test]
async fn test_credential_resolution_order() {
    struct HollowStore;

    #[async_trait]
    impl CredentialStore for HollowStore {
        async fn has_credential(&self, _key: &str) -> bool {
            true
        }

        async fn get_credential(&self, _key: &str) -> Option<Secret> {
            None
        }
    }

    let store: MemoryCredentialStore = [("vault/prod", "from-store")].into_iter().collect();
    let (mapper, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("prod").with_credential_ref("vault/prod"))
            .with_account(account("dev"))
            .with_rule(MappingRule::new(1, "dev").with_user_pattern("dev@*"))
            .with_default_account("prod")
            .with_credential_store(Arc::new(store)),
    );

    let prod = mapper.resolve(&Claims::for_subject("a@x")).await.unwrap();
    assert_eq!(prod.client.token, "from-store");

    let dev = mapper.resolve(&Claims::for_subject("dev@x")).await.unwrap();
    assert_eq!(dev.client.token, "token-dev");

    let (hollow, _) = build_mapper(
        MapperOptions::default()
            .with_account(account("prod"))
            .with_default_account("prod")
            .with_credential_store(Arc::new(HollowStore)),
    );
    let prod = hollow.resolve(&Claims::for_subject("a@x")).await.unwrap();
    assert_eq!(prod.client.token, "token-prod");
}

/// No store value and no static token is a configuration error
#[tokio::test]
async fn test_no_token_available() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(ServiceAccount::new("empty", "Empty"))
            .with_account(ServiceAccount::new("blank", "Blank").with_token("  "))
            .with_rule(MappingRule::new(1, "blank").with_user_pattern("b@*"))
            .with_default_account("empty"),
    );

    let err = mapper.resolve(&Claims::for_subject("a@x")).await.unwrap_err();
    assert!(matches!(err, RouterError::NoToken(ref id) if id == "empty"));

    let err = mapper.resolve(&Claims::for_subject("b@x")).await.unwrap_err();
    assert!(matches!(err, RouterError::NoToken(ref id) if id == "blank"));
    assert_eq!(auditor.events().len(), 2);
}

/// Client construction receives account values, falling back to mapper defaults
#[tokio::test]
async fn test_client_receives_url_and_organization() {
    let options = MapperOptions {
        base_url: Some("https://api.example.com".to_string()),
        organization: Some("acme".to_string()),
        ..MapperOptions::default()
    };
    let (mapper, _) = build_mapper(
        options
            .with_account(account("default"))
            .with_account(
                account("eu")
                    .with_base_url("https://eu.example.com")
                    .with_organization("acme-eu"),
            )
            .with_rule(MappingRule::new(1, "eu").with_user_pattern("*.eu"))
            .with_default_account("default"),
    );

    let default = mapper.resolve(&Claims::for_subject("someone")).await.unwrap();
    assert_eq!(default.client.base_url.as_deref(), Some("https://api.example.com"));
    assert_eq!(default.client.organization.as_deref(), Some("acme"));

    let eu = mapper.resolve(&Claims::for_subject("someone.eu")).await.unwrap();
    assert_eq!(eu.client.base_url.as_deref(), Some("https://eu.example.com"));
    assert_eq!(eu.client.organization.as_deref(), Some("acme-eu"));
}

/// Client factory failures are audited and surfaced
#[tokio::test]
async fn test_client_failure_denied() {
    let auditor = Arc::new(RecordingAuditor::default());
    let mapper = Mapper::with_factory(
        MapperOptions::default()
            .with_account(account("default"))
            .with_default_account("default")
            .with_auditor(auditor.clone()),
        FakeFactory { fail: true },
    )
    .unwrap();

    let err = mapper.resolve(&Claims::for_subject("a")).await.unwrap_err();
    assert!(matches!(err, RouterError::Client(_)));
    assert!(matches!(
        auditor.events().as_slice(),
        [AuditEvent::Denied { account_id: Some(id), .. }] if id == "default"
    ));
}

/// A broken audit sink never changes the routing outcome
#[tokio::test]
async fn test_audit_failures_do_not_mask_results() {
    let mapper = Mapper::with_factory(
        MapperOptions::default()
            .with_account(account("default"))
            .with_rule(MappingRule::new(1, "default").with_user_pattern("ok@*"))
            .with_auditor(Arc::new(BrokenAuditor)),
        FakeFactory::default(),
    )
    .unwrap();

    assert!(mapper.resolve(&Claims::for_subject("ok@x")).await.is_ok());
    assert!(matches!(
        mapper.resolve(&Claims::for_subject("other@x")).await,
        Err(RouterError::NoMapping { .. })
    ));
}

/// Health sweeps audit one event per account; without a monitor nothing happens
#[tokio::test]
async fn test_check_all_accounts_health() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(account("a"))
            .with_account(account("b"))
            .with_health_monitor(monitor(ScriptedProber::failing(&["b"]), 1)),
    );

    let results = mapper.check_all_accounts_health().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results["a"].is_healthy);
    assert!(!results["b"].is_healthy);

    let mut events = auditor.events();
    events.sort_by_key(|e| format!("{:?}", e));
    assert_eq!(
        events,
        vec![
            AuditEvent::HealthCheck {
                account_id: "a".to_string(),
                healthy: true
            },
            AuditEvent::HealthCheck {
                account_id: "b".to_string(),
                healthy: false
            },
        ]
    );

    let (plain, auditor) = build_mapper(MapperOptions::default().with_account(account("a")));
    assert!(plain.check_all_accounts_health().await.unwrap().is_empty());
    assert!(auditor.events().is_empty());
    assert!(plain.health_monitor().is_none());
}

/// Accounts added or replaced later are mirrored into the monitor
#[tokio::test]
async fn test_account_registry_mirrors_health() {
    let health = monitor(ScriptedProber::failing(&[]), 1);
    let (mapper, _) = build_mapper(MapperOptions::default().with_health_monitor(health.clone()));

    mapper.add_account(account("a"));
    assert!(health.get_health("a").is_some());

    health.mark_failed("a", "down");
    mapper.add_account(account("a").with_environment("prod"));
    assert_eq!(mapper.list_accounts().len(), 1);
    assert_eq!(mapper.list_accounts()[0].environment.as_deref(), Some("prod"));
    assert!(!health.get_health("a").unwrap().is_healthy);

    mapper.remove_account("a");
    assert!(health.get_health("a").is_none());
}

/// Shutdown is idempotent with or without a monitor
#[tokio::test]
async fn test_shutdown_idempotent() {
    let prober = ScriptedProber::failing(&[]);
    let health = Arc::new(HealthMonitor::with_prober(HealthConfig::default(), prober));
    assert!(health.is_running());

    let (mapper, _) = build_mapper(MapperOptions::default().with_health_monitor(health.clone()));
    mapper.shutdown();
    mapper.shutdown();
    assert!(!health.is_running());

    let (plain, _) = build_mapper(MapperOptions::default());
    plain.shutdown();
}

/// Resolve can run concurrently from many tasks
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution() {
    let (mapper, auditor) = build_mapper(
        MapperOptions::default()
            .with_account(account("default"))
            .with_account(account("dev"))
            .with_rule(MappingRule::new(1, "dev").with_user_pattern("*@dev.example.com"))
            .with_default_account("default")
            .with_health_monitor(monitor(ScriptedProber::failing(&[]), 1)),
    );
    let mapper = Arc::new(mapper);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let mapper = Arc::clone(&mapper);
            tokio::spawn(async move {
                let subject = if i % 2 == 0 {
                    format!("u{}@dev.example.com", i)
                } else {
                    format!("u{}@other.com", i)
                };
                mapper
                    .resolve(&Claims::for_subject(subject))
                    .await
                    .map(|r| r.account_id)
            })
        })
        .collect();

    let mut dev = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() == "dev" {
            dev += 1;
        }
    }
    assert_eq!(dev, 16);
    assert_eq!(auditor.events().len(), 32);
}

/// The default factory builds real platform clients
#[tokio::test]
async fn test_default_platform_client() {
    let mapper = Mapper::new(
        MapperOptions {
            organization: Some("acme".to_string()),
            ..MapperOptions::default()
        }
        .with_account(account("default").with_base_url("https://api.example.com/v1"))
        .with_default_account("default"),
    )
    .unwrap();

    let resolution = mapper.resolve(&Claims::for_subject("a")).await.unwrap();
    assert_eq!(resolution.client.base_url().as_str(), "https://api.example.com/v1/");
    assert_eq!(resolution.client.organization(), Some("acme"));
    assert!(mapper.auditor().is_some());
}

/// An account without a URL is probed at the same default endpoint its
/// client uses, so it stays routable
#[tokio::test]
async fn test_built_in_monitor_probes_default_endpoint() {
    let prober = Arc::new(RecordingProber::default());
    let (mapper, _) = build_mapper(built_in_health(
        MapperOptions::default()
            .with_account(ServiceAccount::new("default", "Default").with_token("t1"))
            .with_default_account("default"),
        prober.clone(),
    ));
    assert!(mapper.health_monitor().is_some());

    for _ in 0..4 {
        let resolution = mapper.resolve(&Claims::for_subject("a@b.com")).await.unwrap();
        assert_eq!(resolution.account_id, "default");
    }

    let targets = prober.targets();
    assert_eq!(targets.len(), 4);
    for target in targets {
        assert_eq!(target.base_url.as_deref(), Some(DEFAULT_BASE_URL));
        assert!(target.organization.is_none());
    }
}

/// The built-in monitor inherits the mapper's base URL and organization,
/// while account values still win
#[tokio::test]
async fn test_built_in_monitor_inherits_mapper_defaults() {
    let prober = Arc::new(RecordingProber::default());
    let options = MapperOptions {
        base_url: Some("https://api.example.com".to_string()),
        organization: Some("acme".to_string()),
        ..MapperOptions::default()
    };
    let (mapper, _) = build_mapper(built_in_health(
        options
            .with_account(account("default"))
            .with_account(
                account("eu")
                    .with_base_url("https://eu.example.com")
                    .with_organization("acme-eu"),
            )
            .with_rule(MappingRule::new(1, "eu").with_user_pattern("*.eu"))
            .with_default_account("default"),
        prober.clone(),
    ));

    mapper.resolve(&Claims::for_subject("someone")).await.unwrap();
    mapper.resolve(&Claims::for_subject("someone.eu")).await.unwrap();

    let results = mapper.check_all_accounts_health().await.unwrap();
    assert!(results.values().all(|s| s.is_healthy));

    let targets = prober.targets();
    assert_eq!(targets[0].base_url.as_deref(), Some("https://api.example.com"));
    assert_eq!(targets[0].organization.as_deref(), Some("acme"));
    assert_eq!(targets[1].base_url.as_deref(), Some("https://eu.example.com"));
    assert_eq!(targets[1].organization.as_deref(), Some("acme-eu"));

    let swept_default = targets[2..].iter().find(|t| t.account_id == "default").unwrap();
    assert_eq!(swept_default.base_url.as_deref(), Some("https://api.example.com"));
}

/// Accounts whose secret lives in the credential store are probed with it
#[tokio::test]
async fn test_probe_uses_stored_credential() {
    let prober = Arc::new(RecordingProber::default());
    let store: MemoryCredentialStore = [("vault/prod", "from-store")].into_iter().collect();
    let (mapper, _) = build_mapper(built_in_health(
        MapperOptions::default()
            .with_account(ServiceAccount::new("prod", "Prod").with_credential_ref("vault/prod"))
            .with_default_account("prod")
            .with_credential_store(Arc::new(store)),
        prober.clone(),
    ));

    let resolution = mapper.resolve(&Claims::for_subject("a")).await.unwrap();
    assert_eq!(resolution.client.token, "from-store");

    let targets = prober.targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(
        targets[0].token.as_ref().map(|t| t.expose().to_string()),
        Some("from-store".to_string())
    );
}
