//! OpenID configuration discovery
//!
//! Fetches the IAM well-known configuration document on every call. There is
//! no cache: the document is read once per token exchange, which is rare.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::BoxFuture;
use crate::constants::{IAM_URL, OPENID_CONFIGURATION_PATH};
use crate::error::{Error, Result};

/// Endpoint map published at `/identity/.well-known/openid-configuration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    pub passcode_endpoint: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub scopes_supported: Vec<String>,
    pub public_hosts: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
}

/// Source of the provider's endpoint map.
pub trait EndpointDiscovery: Send + Sync {
    fn get_config(&self) -> BoxFuture<'_, Result<OpenIdConfiguration>>;
}

/// Discovery over HTTP against an IAM base URL.
pub struct HttpEndpointDiscovery {
    client: reqwest::Client,
    config_url: String,
}

impl HttpEndpointDiscovery {
    /// `iam_url` is the service base, e.g. `https://iam.cloud.ibm.com`.
    pub fn new(client: reqwest::Client, iam_url: &str) -> Self {
        Self {
            client,
            config_url: format!(
                "{}{}",
                iam_url.trim_end_matches('/'),
                OPENID_CONFIGURATION_PATH
            ),
        }
    }

    /// Discovery against the production IAM service.
    pub fn production(client: reqwest::Client) -> Self {
        Self::new(client, IAM_URL)
    }

    pub fn config_url(&self) -> &str {
        &self.config_url
    }
}

impl EndpointDiscovery for HttpEndpointDiscovery {
    fn get_config(&self) -> BoxFuture<'_, Result<OpenIdConfiguration>> {
        Box::pin(async move {
            debug!(url = %self.config_url, "fetching OpenID configuration");
            let body: serde_json::Value = self
                .client
                .get(&self.config_url)
                .send()
                .await
                .map_err(|e| Error::Http(format!("OpenID configuration request failed: {e}")))?
                .json()
                .await
                .map_err(|e| Error::Http(format!("OpenID configuration is not JSON: {e}")))?;

            parse_config(body)
        })
    }
}

/// Validate a configuration document against the expected endpoint map.
pub(crate) fn parse_config(body: serde_json::Value) -> Result<OpenIdConfiguration> {
    serde_json::from_value(body).map_err(|e| {
        error!(error = %e, "invalid OpenID configuration");
        Error::InvalidConfiguration
    })
}
