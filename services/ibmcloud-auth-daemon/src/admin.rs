//! Admin API for session management
//!
//! Runs on the admin listener (default 127.0.0.1:9090). Never returns access
//! or refresh tokens.
//!
//! Endpoints:
//! - GET    /admin/sessions?scopes=a,b     : list sessions, optionally scope-filtered
//! - DELETE /admin/sessions/{id}           : remove a session and persist
//! - GET    /admin/sessions/{id}/accounts  : accounts visible to a session
//! - POST   /admin/sessions/{id}/account   : re-issue a session for another account

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use ibmcloud_iam::Account;
use ibmcloud_session::{Error, SessionManager};
use provider::ExternalSession;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    manager: Arc<SessionManager>,
    http_client: reqwest::Client,
    accounts_url: String,
}

impl AdminState {
    pub fn new(
        manager: Arc<SessionManager>,
        http_client: reqwest::Client,
        accounts_url: &str,
    ) -> Self {
        Self {
            manager,
            http_client,
            accounts_url: accounts_url.to_string(),
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }
}

/// Build the admin axum router with all session management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/{id}", delete(delete_session))
        .route("/admin/sessions/{id}/accounts", get(list_session_accounts))
        .route("/admin/sessions/{id}/account", post(switch_account))
        .with_state(state)
}

pub(crate) fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

/// Map a lifecycle error to the HTTP status an operator should see.
fn lifecycle_error(err: Error) -> Response {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Iam(_) => StatusCode::BAD_GATEWAY,
        Error::Closed => StatusCode::SERVICE_UNAVAILABLE,
        Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

/// Session view without its access token.
fn redacted(session: &ExternalSession) -> serde_json::Value {
    serde_json::json!({
        "id": session.id,
        "scopes": session.scopes,
        "account": session.account,
    })
}

#[derive(Deserialize)]
struct SessionsQuery {
    /// Comma-separated scope list
    scopes: Option<String>,
}

/// Split `a,b` into scopes, dropping blanks.
fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// GET /admin/sessions: list sessions, filtered to those holding every requested scope.
async fn list_sessions(
    State(state): State<AdminState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let scopes = query.scopes.as_deref().map(parse_scopes);
    match state.manager.get_sessions(scopes.as_deref()).await {
        Ok(sessions) => {
            let sessions: Vec<_> = sessions.iter().map(redacted).collect();
            json_response(StatusCode::OK, serde_json::json!({ "sessions": sessions }))
        }
        Err(e) => lifecycle_error(e),
    }
}

/// DELETE /admin/sessions/{id}: remove a session, then persist the registry.
async fn delete_session(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.manager.remove_session(&id).await {
        return lifecycle_error(e);
    }
    // Removal alone is not written until the next pass
    if let Err(e) = state.manager.persist().await {
        warn!(session_id = id, error = %e, "session removed but not persisted");
    }
    info!(session_id = id, "session removed via admin API");

    json_response(
        StatusCode::OK,
        serde_json::json!({ "session_id": id, "status": "removed" }),
    )
}

/// GET /admin/sessions/{id}/accounts: accounts the session's identity can switch to.
async fn list_session_accounts(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Response {
    let session = match find_session(&state.manager, &id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let accounts = ibmcloud_iam::list_accounts(
        &state.http_client,
        &state.accounts_url,
        &session.access_token,
    )
    .await;
    match accounts {
        Ok(accounts) => json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts })),
        Err(e) => {
            warn!(session_id = id, error = %e, "account listing failed");
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

/// POST /admin/sessions/{id}/account: bind the session to the account in the body.
async fn switch_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    axum::Json(account): axum::Json<Account>,
) -> Response {
    match state.manager.switch_account(&id, &account).await {
        Ok(session) => json_response(StatusCode::OK, redacted(&session)),
        Err(e) => {
            warn!(session_id = id, account = account.guid, error = %e, "account switch failed");
            lifecycle_error(e)
        }
    }
}

async fn find_session(manager: &SessionManager, id: &str) -> Result<ExternalSession, Response> {
    let sessions = manager.get_sessions(None).await.map_err(lifecycle_error)?;
    sessions
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| lifecycle_error(Error::NotFound(id.to_string())))
}
