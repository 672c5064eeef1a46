//! Token endpoint exchange
//!
//! Both grants go through the same POST to the discovered `token_endpoint`:
//! 1. Passcode grant (interactive sign-in)
//! 2. Refresh-token grant (background refresh and account switching)
//!
//! The request carries the fixed client pair as basic auth. The response is
//! validated against the `IamSession` shape before it is handed back.

use std::sync::Arc;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, error};

use crate::BoxFuture;
use crate::accounts::Account;
use crate::constants::{
    DEFAULT_CLIENT_ID, DEFAULT_CLIENT_SECRET, PASSCODE_GRANT_TYPE, REFRESH_GRANT_TYPE,
};
use crate::discovery::EndpointDiscovery;
use crate::error::{Error, Result};
use crate::session::IamSession;

/// Url-encoded form body for the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct GrantForm(Vec<(&'static str, String)>);

impl GrantForm {
    /// `grant_type=urn:ibm:params:oauth:grant-type:passcode&passcode=<value>`
    pub fn passcode(passcode: &str) -> Self {
        Self(vec![
            ("grant_type", PASSCODE_GRANT_TYPE.to_string()),
            ("passcode", passcode.to_string()),
        ])
    }

    /// `grant_type=refresh_token&refresh_token=<value>[&account=<guid>]`
    pub fn refresh(refresh_token: &str, account: Option<&Account>) -> Self {
        let mut fields = vec![
            ("grant_type", REFRESH_GRANT_TYPE.to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(account) = account {
            fields.push(("account", account.guid.clone()));
        }
        Self(fields)
    }

    pub fn grant_type(&self) -> &str {
        self.get("grant_type").unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> &[(&'static str, String)] {
        &self.0
    }
}

// Form values are credentials
impl std::fmt::Debug for GrantForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantForm")
            .field("grant_type", &self.grant_type())
            .finish_non_exhaustive()
    }
}

/// Performs a token endpoint exchange.
pub trait TokenExchanger: Send + Sync {
    fn exchange(&self, form: GrantForm) -> BoxFuture<'_, Result<IamSession>>;
}

/// Token exchange over HTTP, discovering the endpoint on each call.
pub struct HttpTokenExchanger {
    client: reqwest::Client,
    discovery: Arc<dyn EndpointDiscovery>,
    client_id: String,
    client_secret: String,
}

impl HttpTokenExchanger {
    pub fn new(client: reqwest::Client, discovery: Arc<dyn EndpointDiscovery>) -> Self {
        Self::with_client_credentials(client, discovery, DEFAULT_CLIENT_ID, DEFAULT_CLIENT_SECRET)
    }

    pub fn with_client_credentials(
        client: reqwest::Client,
        discovery: Arc<dyn EndpointDiscovery>,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            client,
            discovery,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

impl TokenExchanger for HttpTokenExchanger {
    fn exchange(&self, form: GrantForm) -> BoxFuture<'_, Result<IamSession>> {
        Box::pin(async move {
            let config = self.discovery.get_config().await?;
            debug!(grant_type = form.grant_type(), "calling token endpoint");

            let response = self
                .client
                .post(&config.token_endpoint)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(ACCEPT, "application/json")
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(form.fields())
                .send()
                .await
                .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let reason = body
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("token endpoint returned {status}"));
                return Err(Error::TokenEndpoint(reason));
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Http(format!("token response is not JSON: {e}")))?;
            parse_session(body)
        })
    }
}

/// Validate a token endpoint response against the session shape.
pub(crate) fn parse_session(body: serde_json::Value) -> Result<IamSession> {
    serde_json::from_value(body).map_err(|e| {
        error!(error = %e, "invalid token");
        Error::InvalidToken
    })
}
