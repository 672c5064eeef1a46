//! IBM Cloud IAM protocol adapters
//!
//! Stateless I/O pieces the session manager is built on. Each capability sits
//! behind a trait so the manager can be driven by fakes in tests:
//!
//! - `EndpointDiscovery` fetches and validates the OpenID configuration
//! - `TokenExchanger` POSTs a grant form to the discovered token endpoint
//! - `SessionIssuer` runs the passcode flow and the refresh flow on top of it
//! - `IdentityExtractor` reads the identity claims out of an access token
//! - `SessionStore` mirrors the session list into a `SecretStore`
//!
//! Session flow:
//! 1. `IamSessionIssuer::authenticate()` opens the passcode page and asks for a passcode
//! 2. The passcode is exchanged for an `IamSession`
//! 3. Sessions are persisted via `PersistentSessionStore::save()`
//! 4. Near expiry, `IamSessionIssuer::refresh()` trades the refresh token for a new session

pub mod accounts;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod flows;
pub mod identity;
pub mod session;
pub mod store;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

use std::future::Future;
use std::pin::Pin;

pub use accounts::{Account, list_accounts};
pub use constants::*;
pub use discovery::{EndpointDiscovery, HttpEndpointDiscovery, OpenIdConfiguration};
pub use error::{Error, Result};
pub use flows::{IamSessionIssuer, PasscodePrompt, SessionIssuer, validate_passcode};
pub use identity::{AccessTokenClaims, IdentityExtractor, JwtIdentityExtractor};
pub use session::IamSession;
pub use store::{
    FileSecretStore, MemorySecretStore, PersistentSessionStore, SecretStore, SessionStore,
};
pub use token::{GrantForm, HttpTokenExchanger, TokenExchanger};

/// Boxed future returned by the collaborator traits, so they stay usable as
/// `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
