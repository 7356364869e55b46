//! Downstream platform client construction
//!
//! The mapper hands the resolved token, base URL and organization to a
//! [`ClientFactory`]. [`PlatformClientFactory`] builds a `reqwest` client with
//! the credential injected into its default headers.

use crate::Secret;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Base URL used when neither the account nor the mapper supplies one
pub const DEFAULT_BASE_URL: &str = "https://api.analysis.local";

/// Header carrying the tenant / organization
pub const ORGANIZATION_HEADER: &str = "x-organization";

/// Client construction errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Invalid header value for {0}")]
    InvalidHeader(&'static str),

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Builds downstream clients from resolved credentials
pub trait ClientFactory: Send + Sync {
    /// The client handle returned to callers
    type Client: Send;

    /// Build a client for a token, base URL and organization
    fn create(
        &self,
        token: &Secret,
        base_url: Option<&str>,
        organization: Option<&str>,
    ) -> Result<Self::Client, ClientError>;
}

/// HTTP client for the downstream analysis platform
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: Client,
    base_url: Url,
    organization: Option<String>,
}

impl PlatformClient {
    /// Base URL requests are resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Organization sent with each request
    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    /// Resolve an API path against the base URL
    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidBaseUrl {
                url: format!("{}{}", self.base_url, path),
                reason: e.to_string(),
            })
    }

    /// Start a GET request against an API path
    pub fn get(&self, path: &str) -> Result<reqwest::RequestBuilder, ClientError> {
        Ok(self.http.get(self.endpoint(path)?))
    }

    /// The underlying HTTP client, credentials already attached
    pub fn http(&self) -> &Client {
        &self.http
    }
}

/// Factory for [`PlatformClient`]
#[derive(Debug, Clone)]
pub struct PlatformClientFactory {
    timeout: Duration,
    user_agent: String,
}

impl PlatformClientFactory {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("gatekeeper/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set the request timeout of built clients
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for PlatformClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for PlatformClientFactory {
    type Client = PlatformClient;

    fn create(
        &self,
        token: &Secret,
        base_url: Option<&str>,
        organization: Option<&str>,
    ) -> Result<PlatformClient, ClientError> {
        let base_url = parse_base_url(base_url.unwrap_or(DEFAULT_BASE_URL))?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|_| ClientError::InvalidHeader("Authorization"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        if let Some(org) = organization {
            let value = HeaderValue::from_str(org)
                .map_err(|_| ClientError::InvalidHeader(ORGANIZATION_HEADER))?;
            headers.insert(ORGANIZATION_HEADER, value);
        }

        let http = Client::builder()
            .user_agent(self.user_agent.as_str())
            .timeout(self.timeout)
            .default_headers(headers)
            .build()?;

        Ok(PlatformClient {
            http,
            base_url,
            organization: organization.map(str::to_string),
        })
    }
}

/// Parse a base URL, ensuring it ends with a slash so joins keep its path
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(raw).map_err(|e| ClientError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ClientError::InvalidBaseUrl {
                url: raw.to_string(),
                reason: format!("scheme '{}' not allowed", scheme),
            })
        }
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}
