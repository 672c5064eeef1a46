//! Error types for session lifecycle operations

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session with id {0} not found")]
    NotFound(String),

    /// Passed through unchanged from sign-in, refresh, or conversion
    #[error(transparent)]
    Iam(#[from] ibmcloud_iam::Error),

    #[error("failed to persist sessions: {0}")]
    Store(String),

    #[error("session manager is closed")]
    Closed,
}

/// Result alias for session lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for provider::ProviderError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(id) => provider::ProviderError::NotFound(id),
            Error::Iam(e) => provider::ProviderError::Auth(e.to_string()),
            other => provider::ProviderError::Internal(other.to_string()),
        }
    }
}
