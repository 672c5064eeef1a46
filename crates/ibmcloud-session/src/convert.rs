//! IAM session to host session view

use std::sync::Arc;

use ibmcloud_iam::{AccessTokenClaims, IamSession, IdentityExtractor};
use provider::{ExternalSession, SessionAccount};

/// Build the host view from a session and the claims of its access token.
pub fn to_external_session(session: &IamSession, claims: &AccessTokenClaims) -> ExternalSession {
    ExternalSession {
        id: session.session_id.clone(),
        access_token: session.access_token.clone(),
        scopes: session.scopes().map(str::to_owned).collect(),
        account: SessionAccount {
            id: claims.id.clone(),
            label: claims.name.clone(),
        },
    }
}

/// Converts sessions to host views, reading identity from the access token.
#[derive(Clone)]
pub struct SessionConverter {
    extractor: Arc<dyn IdentityExtractor>,
}

impl SessionConverter {
    pub fn new(extractor: Arc<dyn IdentityExtractor>) -> Self {
        Self { extractor }
    }

    pub fn convert(&self, session: &IamSession) -> ibmcloud_iam::Result<ExternalSession> {
        let claims = self.extractor.extract(&session.access_token)?;
        Ok(to_external_session(session, &claims))
    }
}
