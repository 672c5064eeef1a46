//! IBM Cloud auth daemon
//!
//! Single-binary host for the IBM Cloud session manager that:
//! 1. Restores persisted IAM sessions and keeps them refreshed
//! 2. Registers them with the host as the `ibmcloud-account` provider
//! 3. Serves health, metrics, and the admin API
//! 4. Persists the registry once more on shutdown

mod admin;
mod config;
mod host;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use ibmcloud_iam::{
    EndpointDiscovery, FileSecretStore, HttpEndpointDiscovery, HttpTokenExchanger,
    IamSessionIssuer, JwtIdentityExtractor, PasscodePrompt, PersistentSessionStore,
};
use ibmcloud_session::{Collaborators, ManagerConfig, SessionManager};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{ProviderRegistration, SIGN_IN_SCOPES};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::host::{LogRegistry, TerminalPrompt};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    admin: AdminState,
    prometheus: PrometheusHandle,
}

/// Command-line flags
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config_path: Option<String>,
    /// Start the passcode sign-in on the terminal after startup
    login: bool,
}

fn parse_args(args: &[String]) -> CliArgs {
    CliArgs {
        config_path: args
            .iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1))
            .cloned(),
        login: args.iter().any(|a| a == "--login"),
    }
}

/// Build the axum router with health, metrics, and admin routes.
///
/// The concurrency limit caps in-flight admin requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .merge(admin::build_admin_router(state.admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// Compose the IAM collaborators and open the session manager.
async fn open_manager(
    config: &Config,
    client: reqwest::Client,
    prompt: Arc<dyn PasscodePrompt>,
) -> Result<Arc<SessionManager>> {
    let discovery: Arc<dyn EndpointDiscovery> =
        Arc::new(HttpEndpointDiscovery::new(client.clone(), &config.iam.url));
    let exchanger = Arc::new(HttpTokenExchanger::with_client_credentials(
        client,
        discovery.clone(),
        &config.iam.client_id,
        config.iam.client_secret.expose(),
    ));
    let issuer = Arc::new(IamSessionIssuer::new(discovery, exchanger, prompt));

    let secrets = FileSecretStore::load(config.sessions.store_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open secret store {}",
                config.sessions.store_path.display()
            )
        })?;
    let store = Arc::new(PersistentSessionStore::new(Arc::new(secrets)));

    let manager = SessionManager::open(
        Collaborators {
            issuer,
            store,
            identity: Arc::new(JwtIdentityExtractor),
        },
        ManagerConfig {
            check_interval: config.sessions.check_interval(),
            refresh_threshold_secs: config.sessions.refresh_threshold_secs,
        },
    )
    .await;
    Ok(manager)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ibmcloud-auth-daemon");

    // Install Prometheus metrics recorder before the first expiry pass
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args);

    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        iam_url = %config.iam.url,
        store_path = %config.sessions.store_path.display(),
        check_interval_secs = config.sessions.check_interval_secs,
        listen_addr = %config.admin.listen_addr,
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.iam.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let prompt = Arc::new(TerminalPrompt::stdin());
    let manager = open_manager(&config, client.clone(), prompt).await?;
    info!(sessions = manager.session_count().await, "session manager ready");

    let registry = Arc::new(LogRegistry::default());
    let registration = ProviderRegistration::register(registry, manager.clone())
        .await
        .context("failed to register authentication provider")?;

    let login = cli.login.then(|| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let scopes: Vec<String> = SIGN_IN_SCOPES.iter().map(|s| s.to_string()).collect();
            match manager.create_session(&scopes).await {
                Ok(session) => {
                    info!(session_id = %session.id, account = %session.account.label, "signed in")
                }
                Err(e) => error!(error = %e, "sign-in failed"),
            }
        })
    });

    let app_state = AppState {
        admin: AdminState::new(manager.clone(), client, &config.iam.accounts_url),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "admin API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "admin server error");
    }

    if let Some(login) = login {
        login.abort();
    }
    registration.unregister().await;
    if let Err(e) = manager.close().await {
        error!(error = %e, "failed to persist sessions on shutdown");
    }

    info!("shutdown complete");
    served.context("admin server failed")
}

/// Health endpoint: always 200 while the process serves requests.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.admin.manager().session_count().await;
    admin::json_response(
        axum::http::StatusCode::OK,
        serde_json::json!({ "status": "ok", "sessions": sessions }),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
