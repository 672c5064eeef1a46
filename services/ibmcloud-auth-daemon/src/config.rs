//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The IAM client secret may be overridden with IBMCLOUD_CLIENT_SECRET so
//! deployments that use a non-default client keep it out of the TOML file.

use common::Secret;
use ibmcloud_iam::{ACCOUNTS_URL, DEFAULT_CLIENT_ID, DEFAULT_CLIENT_SECRET, IAM_URL};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub iam: IamConfig,
    pub sessions: SessionsConfig,
    pub admin: AdminConfig,
}

/// IAM endpoints and client credentials
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IamConfig {
    pub url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub accounts_url: String,
    pub timeout_secs: u64,
}

impl Default for IamConfig {
    fn default() -> Self {
        Self {
            url: IAM_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: Secret::from(DEFAULT_CLIENT_SECRET),
            accounts_url: ACCOUNTS_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Session persistence and refresh timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// JSON file backing the secret store
    pub store_path: PathBuf,
    pub check_interval_secs: u64,
    pub refresh_threshold_secs: i64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("ibmcloud-secrets.json"),
            check_interval_secs: 60,
            refresh_threshold_secs: 60,
        }
    }
}

impl SessionsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Admin API listener
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 64,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(secret) = std::env::var("IBMCLOUD_CLIENT_SECRET") {
            config.iam.client_secret = Secret::new(secret);
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let urls = [
            ("iam.url", &self.iam.url),
            ("iam.accounts_url", &self.iam.accounts_url),
        ];
        for (name, url) in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.iam.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sessions.check_interval_secs == 0 {
            return Err(common::Error::Config(
                "check_interval_secs must be greater than 0".into(),
            ));
        }

        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("ibmcloud-auth.toml")
    }
}
