//! Audit trail for routing decisions
//!
//! The [`Auditor`] trait is the sink the mapper reports to. Emission is
//! best-effort: a failing auditor is logged and never changes the outcome of
//! a routing decision.

use crate::health::HealthStatus;
use crate::Claims;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

/// Tracing target used for audit events
pub const AUDIT_TARGET: &str = "gatekeeper::audit";

/// Audit-related errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write audit event: {0}")]
    Write(String),
}

/// Receives routing decisions for auditing
#[async_trait]
pub trait Auditor: Send + Sync {
    /// A caller was routed to an account
    async fn log_access(
        &self,
        claims: &Claims,
        account_id: &str,
        account_name: &str,
        detail: Option<&str>,
    ) -> Result<(), AuditError>;

    /// A caller was denied; `account_id` is `None` when no account was selected
    async fn log_access_denied(
        &self,
        claims: &Claims,
        account_id: Option<&str>,
        reason: &str,
    ) -> Result<(), AuditError>;

    /// Routing moved from one account to its fallback
    async fn log_failover(
        &self,
        from_account: &str,
        to_account: &str,
        reason: &str,
        subject: &str,
    ) -> Result<(), AuditError>;

    /// Result of a health check for an account
    async fn log_health_check(
        &self,
        account_id: &str,
        status: &HealthStatus,
    ) -> Result<(), AuditError>;
}

/// Auditor that emits structured `tracing` events on [`AUDIT_TARGET`]
#[derive(Debug, Default, Clone)]
pub struct TracingAuditor;

impl TracingAuditor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Auditor for TracingAuditor {
    async fn log_access(
        &self,
        claims: &Claims,
        account_id: &str,
        account_name: &str,
        detail: Option<&str>,
    ) -> Result<(), AuditError> {
        info!(
            target: AUDIT_TARGET,
            event = "access",
            subject = %claims.subject(),
            issuer = claims.iss.as_deref(),
            account_id = %account_id,
            account_name = %account_name,
            detail = detail,
            "Access granted"
        );
        Ok(())
    }

    async fn log_access_denied(
        &self,
        claims: &Claims,
        account_id: Option<&str>,
        reason: &str,
    ) -> Result<(), AuditError> {
        warn!(
            target: AUDIT_TARGET,
            event = "access_denied",
            subject = %claims.subject(),
            issuer = claims.iss.as_deref(),
            account_id = account_id,
            reason = %reason,
            "Access denied"
        );
        Ok(())
    }

    async fn log_failover(
        &self,
        from_account: &str,
        to_account: &str,
        reason: &str,
        subject: &str,
    ) -> Result<(), AuditError> {
        warn!(
            target: AUDIT_TARGET,
            event = "failover",
            from = %from_account,
            to = %to_account,
            reason = %reason,
            subject = %subject,
            "Service account failover"
        );
        Ok(())
    }

    async fn log_health_check(
        &self,
        account_id: &str,
        status: &HealthStatus,
    ) -> Result<(), AuditError> {
        info!(
            target: AUDIT_TARGET,
            event = "health_check",
            account_id = %account_id,
            healthy = status.is_healthy,
            failure_count = status.failure_count,
            latency_ms = status.latency.map(|l| l.as_millis() as u64),
            error = status.error.as_deref(),
            "Health check"
        );
        Ok(())
    }
}
