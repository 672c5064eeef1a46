//! Host registration adapter
//!
//! Registers an `AuthenticationProvider` with the host's `ProviderRegistry`
//! and forwards every change event verbatim until the registration is dropped
//! or explicitly unregistered.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::{AuthenticationProvider, Result, SessionsChangeEvent};

/// Provider id the sessions are registered under.
pub const AUTH_ID: &str = "ibmcloud-account";

/// Human-readable provider label shown by the host.
pub const AUTH_LABEL: &str = "IBM Cloud Account";

/// Scopes for the sign-in entry requested after registration.
pub const SIGN_IN_SCOPES: &[&str] = &["ibm openid"];

/// The host application's authentication-provider registry.
pub trait ProviderRegistry: Send + Sync {
    /// Make `provider` available to the host under `id`.
    fn register_provider(
        &self,
        id: &str,
        label: &str,
        provider: Arc<dyn AuthenticationProvider>,
    ) -> Result<()>;

    /// Deliver a change event for the provider registered under `id`.
    fn sessions_changed(&self, id: &str, event: SessionsChangeEvent);

    /// Ask the host to surface a sign-in entry without creating a session.
    fn request_sign_in<'a>(
        &'a self,
        id: &'a str,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Withdraw the provider registered under `id`.
    fn unregister_provider(&self, id: &str);
}

/// A live registration. Dropping it stops event forwarding at once;
/// [`ProviderRegistration::unregister`] first delivers what is buffered.
pub struct ProviderRegistration {
    registry: Arc<dyn ProviderRegistry>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl ProviderRegistration {
    /// Register `provider` under [`AUTH_ID`] and start forwarding its events.
    ///
    /// The subscription is taken before registration so no event emitted
    /// while the host wires the provider is missed. A failed sign-in entry
    /// request is logged and does not undo the registration.
    pub async fn register(
        registry: Arc<dyn ProviderRegistry>,
        provider: Arc<dyn AuthenticationProvider>,
    ) -> Result<Self> {
        let mut events = provider.subscribe();
        registry.register_provider(AUTH_ID, AUTH_LABEL, provider)?;
        info!(provider_id = AUTH_ID, "authentication provider registered");

        let (stop, mut stopped) = oneshot::channel();
        let sink = registry.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => forward(sink.as_ref(), event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(provider_id = AUTH_ID, skipped, "change listener lagged, events dropped");
                        }
                        Err(RecvError::Closed) => {
                            debug!(provider_id = AUTH_ID, "change stream closed");
                            break;
                        }
                    },
                    _ = &mut stopped => {
                        drain(sink.as_ref(), &mut events);
                        break;
                    }
                }
            }
        });

        let scopes: Vec<String> = SIGN_IN_SCOPES.iter().map(|s| s.to_string()).collect();
        if let Err(e) = registry.request_sign_in(AUTH_ID, &scopes).await {
            warn!(provider_id = AUTH_ID, error = %e, "failed to request sign-in entry");
        }

        Ok(Self {
            registry,
            forwarder: Some(forwarder),
            stop: Some(stop),
        })
    }

    /// Deliver events already buffered, stop forwarding, and withdraw the
    /// provider from the host.
    pub async fn unregister(mut self) {
        if let (Some(stop), Some(forwarder)) = (self.stop.take(), self.forwarder.take()) {
            // Err means the forwarder already ended on a closed stream
            let _ = stop.send(());
            if let Err(e) = forwarder.await {
                warn!(provider_id = AUTH_ID, error = %e, "event forwarder failed");
            }
        }
        self.registry.unregister_provider(AUTH_ID);
        info!(provider_id = AUTH_ID, "authentication provider unregistered");
    }
}

fn forward(sink: &dyn ProviderRegistry, event: SessionsChangeEvent) {
    debug!(
        provider_id = AUTH_ID,
        kind = event.kind(),
        sessions = event.sessions().len(),
        "forwarding session change"
    );
    sink.sessions_changed(AUTH_ID, event);
}

/// Forward everything still queued on `events` without waiting for more.
fn drain(sink: &dyn ProviderRegistry, events: &mut broadcast::Receiver<SessionsChangeEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => forward(sink, event),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(provider_id = AUTH_ID, skipped, "change listener lagged, events dropped");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

impl Drop for ProviderRegistration {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
