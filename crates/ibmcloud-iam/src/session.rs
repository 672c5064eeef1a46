//! IAM session record
//!
//! The token endpoint response and the persisted form are the same shape, so
//! one serde type validates both. Unknown fields are ignored; missing or
//! mistyped required fields fail deserialization.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An authenticated IAM session.
///
/// `expiration` and `refresh_token_expiration` are absolute unix timestamps in
/// seconds; `expires_in` is the lifetime in seconds at issue time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamSession {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub expiration: i64,
    pub refresh_token_expiration: i64,
    /// Space-delimited scope string
    pub scope: String,
    pub session_id: String,
}

impl IamSession {
    /// Individual scopes, split on single spaces.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split(' ')
    }

    /// Whether every requested scope is granted (set-subset, not substring).
    pub fn has_scopes<S: AsRef<str>>(&self, requested: &[S]) -> bool {
        requested
            .iter()
            .all(|wanted| self.scopes().any(|granted| granted == wanted.as_ref()))
    }

    /// Seconds from `now` until the access token expires. Negative once expired.
    ///
    /// Saturates, so out-of-range persisted timestamps still compare sensibly.
    pub fn seconds_until_expiry(&self, now: i64) -> i64 {
        self.expiration.saturating_sub(now)
    }
}

impl fmt::Debug for IamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamSession")
            .field("session_id", &self.session_id)
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expiration", &self.expiration)
            .field("refresh_token_expiration", &self.refresh_token_expiration)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
