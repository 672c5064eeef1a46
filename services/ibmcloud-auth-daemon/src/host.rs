//! Terminal host collaborators
//!
//! `TerminalPrompt` runs the passcode flow on the daemon's terminal and
//! `LogRegistry` plays the host application's provider registry, recording
//! registrations and logging every change event it receives.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use ibmcloud_iam::{BoxFuture, PasscodePrompt, validate_passcode};
use provider::{AuthenticationProvider, ProviderError, ProviderRegistry, SessionsChangeEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

/// Passcode prompt reading from a line-oriented input, stdin in production.
pub struct TerminalPrompt<R> {
    lines: tokio::sync::Mutex<Lines<R>>,
}

impl TerminalPrompt<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> TerminalPrompt<R> {
    pub fn new(input: R) -> Self {
        Self {
            lines: tokio::sync::Mutex::new(input.lines()),
        }
    }
}

impl<R: AsyncBufRead + Unpin + Send> PasscodePrompt for TerminalPrompt<R> {
    fn open_passcode_page<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ibmcloud_iam::Result<()>> {
        Box::pin(async move {
            info!(url, "passcode page requested");
            eprintln!("Open {url} in a browser to get a one-time passcode.");
            Ok(())
        })
    }

    fn request_passcode(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            let mut lines = self.lines.lock().await;
            loop {
                eprint!("Passcode: ");
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(error = %e, "failed to read passcode");
                        return None;
                    }
                };

                let passcode = line.trim();
                // Blank input cancels
                if passcode.is_empty() {
                    return None;
                }
                match validate_passcode(passcode) {
                    Some(message) => eprintln!("{message}"),
                    None => return Some(passcode.to_string()),
                }
            }
        })
    }
}

/// Provider registry that logs instead of rendering a UI.
#[derive(Default)]
pub struct LogRegistry {
    providers: Mutex<HashMap<String, String>>,
}

impl LogRegistry {
    /// Label of the provider registered under `id`, if any.
    pub fn label(&self, id: &str) -> Option<String> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.providers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProviderRegistry for LogRegistry {
    fn register_provider(
        &self,
        id: &str,
        label: &str,
        _provider: Arc<dyn AuthenticationProvider>,
    ) -> provider::Result<()> {
        let mut providers = self.lock();
        if providers.contains_key(id) {
            return Err(ProviderError::Internal(format!(
                "provider {id} is already registered"
            )));
        }
        providers.insert(id.to_string(), label.to_string());
        info!(provider_id = id, label, "provider registered with host");
        Ok(())
    }

    fn sessions_changed(&self, id: &str, event: SessionsChangeEvent) {
        for session in event.sessions() {
            info!(
                provider_id = id,
                kind = event.kind(),
                session_id = %session.id,
                account = %session.account.label,
                "sessions changed"
            );
        }
    }

    fn request_sign_in<'a>(
        &'a self,
        id: &'a str,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = provider::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                provider_id = id,
                ?scopes,
                "sign in available: restart with --login to start the passcode flow"
            );
            Ok(())
        })
    }

    fn unregister_provider(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            info!(provider_id = id, "provider unregistered from host");
        }
    }
}
