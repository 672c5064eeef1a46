//! Error types for IAM operations

/// Errors from IAM endpoint calls, token decoding, and session persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("error in token authentication: {0}")]
    TokenEndpoint(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("invalid OpenID configuration")]
    InvalidConfiguration,

    #[error("invalid sessions")]
    InvalidSessions,

    #[error("invalid account")]
    InvalidAccount,

    #[error("did not receive a passcode")]
    PasscodeCancelled,

    #[error("no refresh token found")]
    MissingRefreshToken,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for IAM operations.
pub type Result<T> = std::result::Result<T, Error>;
