//! Host-facing authentication provider boundary
//!
//! Defines the provider-agnostic session view handed to the host application,
//! the change-event payload, and the `AuthenticationProvider` trait the host
//! calls into. The IBM Cloud session manager implements the trait; the
//! `registry` module adapts any implementation to a host `ProviderRegistry`.

pub mod registry;

pub use registry::{AUTH_ID, AUTH_LABEL, ProviderRegistration, ProviderRegistry, SIGN_IN_SCOPES};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Account descriptor attached to a session view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAccount {
    /// Stable identity id of the signed-in user
    pub id: String,
    /// Display label (the user's name)
    pub label: String,
}

/// Provider-agnostic view of a session, recomputed on demand and never stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSession {
    pub id: String,
    pub access_token: String,
    pub scopes: Vec<String>,
    pub account: SessionAccount,
}

impl fmt::Debug for ExternalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSession")
            .field("id", &self.id)
            .field("access_token", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("account", &self.account)
            .finish()
    }
}

/// Change notification carrying only the deltas of one mutation.
///
/// Serializes as `{"added": [...]}`, `{"changed": [...]}` or `{"removed": [...]}`;
/// the enum makes a mixed event unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionsChangeEvent {
    Added(Vec<ExternalSession>),
    Changed(Vec<ExternalSession>),
    Removed(Vec<ExternalSession>),
}

impl SessionsChangeEvent {
    /// Event kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionsChangeEvent::Added(_) => "added",
            SessionsChangeEvent::Changed(_) => "changed",
            SessionsChangeEvent::Removed(_) => "removed",
        }
    }

    /// Sessions carried by this event.
    pub fn sessions(&self) -> &[ExternalSession] {
        match self {
            SessionsChangeEvent::Added(s)
            | SessionsChangeEvent::Changed(s)
            | SessionsChangeEvent::Removed(s) => s,
        }
    }
}

/// Errors surfaced to the host through the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// The three callbacks a host invokes on an authentication provider, plus the
/// change-event stream it listens to.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AuthenticationProvider>`).
pub trait AuthenticationProvider: Send + Sync {
    /// Mint a new session. Providers may ignore `scopes`.
    fn create_session<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ExternalSession>> + Send + 'a>>;

    /// List sessions, keeping only those granted every requested scope when
    /// `scopes` is given.
    fn get_sessions<'a>(
        &'a self,
        scopes: Option<&'a [String]>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ExternalSession>>> + Send + 'a>>;

    /// Remove a session by id. Unknown ids fail with `ProviderError::NotFound`.
    fn remove_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Subscribe to session change events.
    fn subscribe(&self) -> broadcast::Receiver<SessionsChangeEvent>;
}
