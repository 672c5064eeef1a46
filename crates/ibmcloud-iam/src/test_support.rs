//! In-process fake of the IAM endpoints for HTTP adapter tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use tokio::net::TcpListener;

/// What the fake token endpoint answers.
#[derive(Clone)]
pub(crate) enum Reply {
    Ok(serde_json::Value),
    Status(u16, serde_json::Value),
}

/// A request captured by the fake token endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub form: HashMap<String, String>,
}

#[derive(Clone)]
struct FakeState {
    base_url: String,
    config: Option<serde_json::Value>,
    token: Reply,
    accounts: Reply,
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

pub(crate) struct FakeIam {
    pub url: String,
    pub recorded: Arc<Mutex<Vec<Recorded>>>,
    _server: tokio::task::JoinHandle<()>,
}

impl FakeIam {
    pub fn requests(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }
}

pub(crate) fn session_json(id: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": format!("at_{id}"),
        "refresh_token": format!("rt_{id}"),
        "token_type": "Bearer",
        "expires_in": 3600,
        "expiration": 1_700_003_600,
        "refresh_token_expiration": 1_702_592_000,
        "scope": "ibm openid",
        "session_id": id,
    })
}

pub(crate) fn openid_config_json(base_url: &str) -> serde_json::Value {
    serde_json::json!({
        "issuer": format!("{base_url}/identity"),
        "passcode_endpoint": format!("{base_url}/identity/passcode"),
        "authorization_endpoint": format!("{base_url}/identity/authorize"),
        "token_endpoint": format!("{base_url}/identity/token"),
        "userinfo_endpoint": format!("{base_url}/identity/userinfo"),
        "jwks_uri": format!("{base_url}/identity/keys"),
        "scopes_supported": ["openid"],
        "public_hosts": ["iam.cloud.ibm.com"],
        "response_types_supported": ["code", "token"],
        "grant_types_supported": ["urn:ibm:params:oauth:grant-type:passcode", "refresh_token"],
    })
}

/// Start a fake IAM server. `config: None` serves a well-formed configuration
/// document pointing back at the fake.
pub(crate) async fn start_fake_iam(
    config: Option<serde_json::Value>,
    token: Reply,
    accounts: Reply,
) -> FakeIam {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let recorded = Arc::new(Mutex::new(Vec::new()));

    let state = FakeState {
        base_url: url.clone(),
        config,
        token,
        accounts,
        recorded: recorded.clone(),
    };

    let app = Router::new()
        .route("/identity/.well-known/openid-configuration", get(config_handler))
        .route("/identity/token", post(token_handler))
        .route("/v1/accounts", get(accounts_handler))
        .with_state(state);

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeIam {
        url,
        recorded,
        _server: server,
    }
}

fn reply(reply: &Reply) -> axum::response::Response {
    match reply {
        Reply::Ok(body) => (StatusCode::OK, Json(body.clone())).into_response(),
        Reply::Status(code, body) => (
            StatusCode::from_u16(*code).unwrap(),
            Json(body.clone()),
        )
            .into_response(),
    }
}

async fn config_handler(State(state): State<FakeState>) -> impl IntoResponse {
    let body = state
        .config
        .clone()
        .unwrap_or_else(|| openid_config_json(&state.base_url));
    Json(body)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn token_handler(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    state.recorded.lock().unwrap().push(Recorded {
        authorization: header(&headers, "authorization"),
        content_type: header(&headers, "content-type"),
        accept: header(&headers, "accept"),
        form,
    });
    reply(&state.token)
}

async fn accounts_handler(State(state): State<FakeState>, headers: HeaderMap) -> impl IntoResponse {
    state.recorded.lock().unwrap().push(Recorded {
        authorization: header(&headers, "authorization"),
        content_type: None,
        accept: header(&headers, "accept"),
        form: HashMap::new(),
    });
    reply(&state.accounts)
}
