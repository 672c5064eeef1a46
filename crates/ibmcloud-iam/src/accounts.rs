//! Cloud account listing
//!
//! A user may belong to several billing accounts. Listing them lets the caller
//! pick one and re-issue a session bound to it with the refresh grant's
//! `account` parameter.

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// An IBM Cloud account the signed-in identity can switch to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub guid: String,
    pub name: String,
    /// Identity id of the account's primary owner
    pub ibmid: String,
}

#[derive(Deserialize)]
struct AccountPage {
    #[allow(dead_code)]
    next_url: Option<String>,
    resources: Vec<AccountResource>,
}

#[derive(Deserialize)]
struct AccountResource {
    metadata: AccountMetadata,
    entity: AccountEntity,
}

#[derive(Deserialize)]
struct AccountMetadata {
    guid: String,
}

#[derive(Deserialize)]
struct AccountEntity {
    name: String,
    primary_owner: PrimaryOwner,
}

#[derive(Deserialize)]
struct PrimaryOwner {
    ibmid: String,
}

/// List the accounts visible to `access_token`.
pub async fn list_accounts(
    client: &reqwest::Client,
    accounts_url: &str,
    access_token: &str,
) -> Result<Vec<Account>> {
    let body: serde_json::Value = client
        .get(accounts_url)
        .header(ACCEPT, "application/json")
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| Error::Http(format!("account listing request failed: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Http(format!("account listing is not JSON: {e}")))?;

    let accounts = parse_accounts(body)?;
    debug!(accounts = accounts.len(), "listed cloud accounts");
    Ok(accounts)
}

fn parse_accounts(body: serde_json::Value) -> Result<Vec<Account>> {
    let page: AccountPage = serde_json::from_value(body).map_err(|e| {
        error!(error = %e, "invalid account");
        Error::InvalidAccount
    })?;

    Ok(page
        .resources
        .into_iter()
        .map(|r| Account {
            guid: r.metadata.guid,
            name: r.entity.name,
            ibmid: r.entity.primary_owner.ibmid,
        })
        .collect())
}
