//! Reachability probes for service accounts

use crate::client::{parse_base_url, ORGANIZATION_HEADER};
use crate::Secret;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// Probe failures; captured into health status, never surfaced to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("No endpoint configured for account")]
    NoEndpoint,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Probe timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Everything a probe needs to reach an account's endpoint
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub account_id: String,
    pub base_url: Option<String>,
    pub organization: Option<String>,
    pub token: Option<Secret>,
}

/// Checks whether an account's endpoint is reachable
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError>;
}

/// Probes `GET {base_url}{path}` with the account's bearer token
pub struct HttpProber {
    client: Client,
    path: String,
}

impl HttpProber {
    /// Create a prober for the given health path
    pub fn new(path: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(format!("gatekeeper/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            path: path.into(),
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        let base = target.base_url.as_deref().ok_or(ProbeError::NoEndpoint)?;
        let url = parse_base_url(base)
            .and_then(|b| {
                b.join(self.path.trim_start_matches('/'))
                    .map_err(|e| crate::client::ClientError::InvalidBaseUrl {
                        url: base.to_string(),
                        reason: e.to_string(),
                    })
            })
            .map_err(|e| ProbeError::InvalidEndpoint(e.to_string()))?;

        let mut request = self.client.get(url);
        if let Some(token) = &target.token {
            request = request.bearer_auth(token.expose());
        }
        if let Some(org) = &target.organization {
            request = request.header(ORGANIZATION_HEADER, org);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProbeError::Request(e.without_url().to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(response.status().as_u16()))
        }
    }
}
