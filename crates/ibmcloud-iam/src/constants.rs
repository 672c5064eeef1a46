//! IBM Cloud IAM constants
//!
//! The `bx` client pair is the public client the IBM Cloud CLI uses against
//! the token endpoint. It identifies the client application and is not a
//! user secret; the real secrets are the tokens kept by the session store.

/// Base URL of the IAM service
pub const IAM_URL: &str = "https://iam.cloud.ibm.com";

/// Path of the OpenID configuration document, relative to `IAM_URL`
pub const OPENID_CONFIGURATION_PATH: &str = "/identity/.well-known/openid-configuration";

/// Default client id sent as basic auth to the token endpoint
pub const DEFAULT_CLIENT_ID: &str = "bx";

/// Default client secret sent as basic auth to the token endpoint
pub const DEFAULT_CLIENT_SECRET: &str = "bx";

/// Grant type for exchanging a one-time passcode
pub const PASSCODE_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:passcode";

/// Grant type for exchanging a refresh token
pub const REFRESH_GRANT_TYPE: &str = "refresh_token";

/// Account listing endpoint
pub const ACCOUNTS_URL: &str = "https://accounts.cloud.ibm.com/v1/accounts";

/// Shortest passcode accepted before it is sent to the token endpoint
pub const MIN_PASSCODE_LEN: usize = 6;

/// Key under which the session list is stored in the secret store
pub const SESSIONS_KEY: &str = "ibmcloud-auth-sessions";
