//! Passcode sign-in and refresh-token flows
//!
//! The passcode flow is interactive: the user opens the IAM passcode page in
//! a browser, copies the one-time code, and types it back into the host. The
//! host side of that interaction is the `PasscodePrompt` collaborator.

use std::sync::Arc;

use tracing::{debug, info};

use crate::BoxFuture;
use crate::accounts::Account;
use crate::constants::MIN_PASSCODE_LEN;
use crate::discovery::EndpointDiscovery;
use crate::error::{Error, Result};
use crate::session::IamSession;
use crate::token::{GrantForm, TokenExchanger};

/// Host-side interaction for the passcode flow.
pub trait PasscodePrompt: Send + Sync {
    /// Show the passcode page to the user (typically by opening a browser).
    fn open_passcode_page<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Ask the user for the passcode. `None` means the user cancelled.
    fn request_passcode(&self) -> BoxFuture<'_, Option<String>>;
}

/// Validation message for a typed passcode, or `None` when acceptable.
pub fn validate_passcode(value: &str) -> Option<&'static str> {
    if value.chars().count() < MIN_PASSCODE_LEN {
        return Some("Passcode must be at least 6 characters");
    }
    None
}

/// Mints and renews sessions.
pub trait SessionIssuer: Send + Sync {
    /// Run the interactive passcode flow and return a new session.
    fn authenticate(&self) -> BoxFuture<'_, Result<IamSession>>;

    /// Trade the session's refresh token for a new session, optionally bound
    /// to a specific account.
    fn refresh<'a>(
        &'a self,
        session: &'a IamSession,
        account: Option<&'a Account>,
    ) -> BoxFuture<'a, Result<IamSession>>;
}

/// `SessionIssuer` over the IAM passcode page and token endpoint.
pub struct IamSessionIssuer {
    discovery: Arc<dyn EndpointDiscovery>,
    exchanger: Arc<dyn TokenExchanger>,
    prompt: Arc<dyn PasscodePrompt>,
}

impl IamSessionIssuer {
    pub fn new(
        discovery: Arc<dyn EndpointDiscovery>,
        exchanger: Arc<dyn TokenExchanger>,
        prompt: Arc<dyn PasscodePrompt>,
    ) -> Self {
        Self {
            discovery,
            exchanger,
            prompt,
        }
    }
}

impl SessionIssuer for IamSessionIssuer {
    fn authenticate(&self) -> BoxFuture<'_, Result<IamSession>> {
        Box::pin(async move {
            let config = self.discovery.get_config().await?;
            info!(url = %config.passcode_endpoint, "opening passcode page");
            self.prompt
                .open_passcode_page(&config.passcode_endpoint)
                .await?;

            let passcode = self
                .prompt
                .request_passcode()
                .await
                .filter(|p| !p.trim().is_empty())
                .ok_or(Error::PasscodeCancelled)?;

            self.exchanger
                .exchange(GrantForm::passcode(passcode.trim()))
                .await
        })
    }

    fn refresh<'a>(
        &'a self,
        session: &'a IamSession,
        account: Option<&'a Account>,
    ) -> BoxFuture<'a, Result<IamSession>> {
        Box::pin(async move {
            if session.refresh_token.is_empty() {
                return Err(Error::MissingRefreshToken);
            }
            debug!(
                session_id = %session.session_id,
                account = account.map(|a| a.guid.as_str()),
                "refreshing session"
            );
            self.exchanger
                .exchange(GrantForm::refresh(&session.refresh_token, account))
                .await
        })
    }
}
