//! Session registry and lifecycle
//!
//! The registry is a `Vec<IamSession>` behind one tokio Mutex. Every mutation
//! (append, replace, remove) happens under that lock, located by session id
//! rather than a remembered index. Token endpoint calls never hold the lock:
//! the expiry pass works from a snapshot and re-locks only to apply results,
//! so a slow or hung exchange cannot stall host calls.
//!
//! Exactly one change event is published per mutation, while the lock is held,
//! so listeners observe events in mutation order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ibmcloud_iam::{Account, IamSession, IdentityExtractor, SessionIssuer, SessionStore};
use provider::{AuthenticationProvider, ExternalSession, SessionsChangeEvent};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::convert::SessionConverter;
use crate::error::{Error, Result};
use crate::monitor::spawn_monitor_task;

/// Period of the background expiry check.
pub const CHECK_TOKEN_INTERVAL: Duration = Duration::from_secs(60);

/// Sessions expiring in fewer than this many seconds are refreshed.
pub const REFRESH_THRESHOLD_SECS: i64 = 60;

/// Buffered change events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Timing knobs for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub check_interval: Duration,
    pub refresh_threshold_secs: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: CHECK_TOKEN_INTERVAL,
            refresh_threshold_secs: REFRESH_THRESHOLD_SECS,
        }
    }
}

/// External capabilities the manager is composed from.
#[derive(Clone)]
pub struct Collaborators {
    pub issuer: Arc<dyn SessionIssuer>,
    pub store: Arc<dyn SessionStore>,
    pub identity: Arc<dyn IdentityExtractor>,
}

/// Outcome of one expiry-check pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub refreshed: usize,
    pub evicted: usize,
    /// The pass did not run because another one was in progress.
    pub skipped: bool,
}

/// Authoritative registry of IAM sessions.
///
/// Created with [`SessionManager::open`], which returns only after the first
/// expiry check has run and the timer is armed. [`SessionManager::close`]
/// must be the last call.
pub struct SessionManager {
    sessions: Mutex<Vec<IamSession>>,
    issuer: Arc<dyn SessionIssuer>,
    store: Arc<dyn SessionStore>,
    converter: SessionConverter,
    events: std::sync::Mutex<Option<broadcast::Sender<SessionsChangeEvent>>>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
    pass_lock: Mutex<()>,
    persist_lock: Mutex<()>,
    refresh_threshold_secs: i64,
}

impl SessionManager {
    /// Restore persisted sessions, run one expiry check, and arm the timer.
    ///
    /// Never fails: unreadable persisted state starts an empty registry and a
    /// failing first pass is logged.
    pub async fn open(collaborators: Collaborators, config: ManagerConfig) -> Arc<Self> {
        let manager = Self::restore(collaborators, &config).await;

        if let Err(e) = manager.monitor_tokens().await {
            error!(error = %e, "error during the initial token check");
        }

        let handle = spawn_monitor_task(Arc::downgrade(&manager), config.check_interval);
        *lock_std(&manager.monitor) = Some(handle);
        manager
    }

    /// Load persisted sessions into a manager with no timer armed.
    async fn restore(collaborators: Collaborators, config: &ManagerConfig) -> Arc<Self> {
        let restored = collaborators.store.load().await;
        info!(sessions = restored.len(), "opening session manager");
        record_active(restored.len());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            sessions: Mutex::new(restored),
            issuer: collaborators.issuer,
            store: collaborators.store,
            converter: SessionConverter::new(collaborators.identity),
            events: std::sync::Mutex::new(Some(events)),
            monitor: std::sync::Mutex::new(None),
            pass_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            refresh_threshold_secs: config.refresh_threshold_secs,
        })
    }

    /// Run one expiry-check pass.
    ///
    /// Sessions expiring within the threshold (or already expired) are
    /// refreshed one at a time. A refresh failure evicts that session and is
    /// logged; it never aborts the pass. The post-pass registry is saved once.
    /// Returns an error only when that save fails.
    ///
    /// If another pass is still running the call returns immediately with
    /// `skipped` set.
    pub async fn monitor_tokens(&self) -> Result<PassSummary> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("token check already in progress, skipping");
            return Ok(PassSummary {
                skipped: true,
                ..Default::default()
            });
        };

        let now = now_secs();
        let snapshot = self.sessions.lock().await.clone();
        let mut summary = PassSummary::default();

        for session in &snapshot {
            let delta = session.seconds_until_expiry(now);
            if delta >= self.refresh_threshold_secs {
                continue;
            }
            if !self.is_current(session).await {
                debug!(session_id = %session.session_id, "session changed since snapshot, skipping refresh");
                continue;
            }
            debug!(session_id = %session.session_id, delta, "session near expiry, refreshing");

            match self.issuer.refresh(session, None).await {
                Ok(refreshed) => {
                    if self
                        .apply_refresh(&session.session_id, Some(session), refreshed)
                        .await
                        .is_some()
                    {
                        summary.refreshed += 1;
                        record_refresh("refreshed");
                    }
                }
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "error refreshing token, removing session");
                    if self.evict(session).await {
                        summary.evicted += 1;
                        record_refresh("evicted");
                    }
                }
            }
        }

        self.persist().await?;
        if summary.refreshed + summary.evicted > 0 {
            info!(
                refreshed = summary.refreshed,
                evicted = summary.evicted,
                "token check complete"
            );
        }
        Ok(summary)
    }

    /// Sign in with the passcode flow and register the new session.
    ///
    /// Requested scopes are ignored: IAM grants a fixed scope set. Failures
    /// propagate unchanged and leave the registry untouched.
    pub async fn create_session(&self, scopes: &[String]) -> Result<ExternalSession> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !scopes.is_empty() {
            debug!(?scopes, "ignoring requested scopes");
        }

        let session = self.issuer.authenticate().await?;
        let view = self.converter.convert(&session)?;

        {
            let mut sessions = self.sessions.lock().await;
            match sessions
                .iter()
                .position(|s| s.session_id == session.session_id)
            {
                // Same IAM session signed in again: keep ids unique
                Some(index) => {
                    sessions[index] = session;
                    self.publish(SessionsChangeEvent::Changed(vec![view.clone()]));
                }
                None => {
                    sessions.push(session);
                    self.publish(SessionsChangeEvent::Added(vec![view.clone()]));
                }
            }
            record_active(sessions.len());
        }
        info!(session_id = %view.id, account = %view.account.label, "session created");

        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist new session");
        }
        Ok(view)
    }

    /// Views of registered sessions, in registry order.
    ///
    /// With `scopes`, only sessions granted every requested scope are kept.
    pub async fn get_sessions(&self, scopes: Option<&[String]>) -> Result<Vec<ExternalSession>> {
        let sessions = self.sessions.lock().await.clone();
        sessions
            .iter()
            .filter(|s| scopes.is_none_or(|wanted| s.has_scopes(wanted)))
            .map(|s| self.converter.convert(s).map_err(Error::from))
            .collect()
    }

    /// Remove a session by id and publish a `removed` event.
    ///
    /// Does not persist; the next pass or `persist()` writes the change.
    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let index = sessions
            .iter()
            .position(|s| s.session_id == session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;

        let removed = sessions.remove(index);
        record_active(sessions.len());
        if let Some(view) = self.view(&removed) {
            self.publish(SessionsChangeEvent::Removed(vec![view]));
        }
        info!(session_id, "session removed");
        Ok(())
    }

    /// Re-issue a session bound to `account` via the refresh grant.
    ///
    /// Unlike the background pass, a failure here is returned to the caller
    /// and the session is kept.
    pub async fn switch_account(
        &self,
        session_id: &str,
        account: &Account,
    ) -> Result<ExternalSession> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let current = self
            .sessions
            .lock()
            .await
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;

        let refreshed = self.issuer.refresh(&current, Some(account)).await?;
        let view = self.converter.convert(&refreshed)?;
        self.apply_refresh(session_id, None, refreshed)
            .await
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        info!(session_id, account = %account.guid, "session switched account");

        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist switched session");
        }
        Ok(view)
    }

    /// Write the current registry to the store.
    pub async fn persist(&self) -> Result<()> {
        // Serialize writers so an older snapshot never lands after a newer one
        let _writer = self.persist_lock.lock().await;
        let snapshot = self.sessions.lock().await.clone();
        self.store
            .save(&snapshot)
            .await
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Subscribe to change events. After `close` the stream is already ended.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionsChangeEvent> {
        match lock_std(&self.events).as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Cancel the timer, persist the registry, and end the event stream.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = lock_std(&self.monitor).take() {
            handle.abort();
            debug!("token monitor cancelled");
        }

        let result = self.persist().await;
        if lock_std(&self.events).take().is_some() {
            info!("session manager closed");
        }
        result
    }

    fn is_closed(&self) -> bool {
        lock_std(&self.events).is_none()
    }

    /// Whether the registry still holds `session` exactly as snapshotted.
    async fn is_current(&self, session: &IamSession) -> bool {
        self.sessions
            .lock()
            .await
            .iter()
            .any(|s| s == session)
    }

    /// Replace the session `original_id` with `refreshed` and publish `changed`.
    ///
    /// With `expected`, the slot must still hold that exact session; a slot
    /// replaced while the refresh was in flight keeps the newer session.
    /// Returns the slot index, or `None` if the result was discarded.
    async fn apply_refresh(
        &self,
        original_id: &str,
        expected: Option<&IamSession>,
        refreshed: IamSession,
    ) -> Option<usize> {
        let view = self.view(&refreshed);
        let mut sessions = self.sessions.lock().await;
        let Some(index) = sessions.iter().position(|s| s.session_id == original_id) else {
            debug!(session_id = original_id, "session removed during refresh, discarding result");
            return None;
        };
        if expected.is_some_and(|original| sessions[index] != *original) {
            debug!(session_id = original_id, "session replaced during refresh, discarding result");
            return None;
        }

        if refreshed.session_id != original_id {
            let new_id = refreshed.session_id.clone();
            let mut i = 0;
            sessions.retain(|s| {
                let keep = i == index || s.session_id != new_id;
                i += 1;
                keep
            });
            warn!(
                old_session_id = original_id,
                new_session_id = %new_id,
                "refresh issued a new session id"
            );
        }

        let index = sessions
            .iter()
            .position(|s| s.session_id == original_id)
            .unwrap_or(index);
        sessions[index] = refreshed;
        record_active(sessions.len());
        if let Some(view) = view {
            self.publish(SessionsChangeEvent::Changed(vec![view]));
        }
        Some(index)
    }

    /// Drop `original` from the registry and publish `removed` with its
    /// pre-failure view. Returns false if it was already gone or replaced.
    async fn evict(&self, original: &IamSession) -> bool {
        let view = self.view(original);
        let mut sessions = self.sessions.lock().await;
        let Some(index) = sessions.iter().position(|s| s == original) else {
            debug!(session_id = %original.session_id, "session replaced or removed during refresh, keeping registry");
            return false;
        };

        sessions.remove(index);
        record_active(sessions.len());
        if let Some(view) = view {
            self.publish(SessionsChangeEvent::Removed(vec![view]));
        }
        true
    }

    /// View for an event payload. Conversion failures are logged and yield no event.
    fn view(&self, session: &IamSession) -> Option<ExternalSession> {
        match self.converter.convert(session) {
            Ok(view) => Some(view),
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "cannot convert session for change event");
                None
            }
        }
    }

    fn publish(&self, event: SessionsChangeEvent) {
        if let Some(tx) = lock_std(&self.events).as_ref() {
            debug!(kind = event.kind(), "publishing session change");
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }
}

impl AuthenticationProvider for SessionManager {
    fn create_session<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = provider::Result<ExternalSession>> + Send + 'a>> {
        Box::pin(async move { Ok(SessionManager::create_session(self, scopes).await?) })
    }

    fn get_sessions<'a>(
        &'a self,
        scopes: Option<&'a [String]>,
    ) -> Pin<Box<dyn Future<Output = provider::Result<Vec<ExternalSession>>> + Send + 'a>> {
        Box::pin(async move { Ok(SessionManager::get_sessions(self, scopes).await?) })
    }

    fn remove_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<()>> + Send + 'a>> {
        Box::pin(async move { Ok(SessionManager::remove_session(self, session_id).await?) })
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionsChangeEvent> {
        SessionManager::subscribe(self)
    }
}

/// Current unix time in seconds, rounded to the nearest second.
fn now_secs() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    ((millis + 500) / 1000) as i64
}

fn lock_std<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn record_refresh(outcome: &'static str) {
    metrics::counter!("ibmcloud_session_refresh_total", "outcome" => outcome).increment(1);
}

fn record_active(count: usize) {
    metrics::gauge!("ibmcloud_sessions_active").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibmcloud_iam::{
        AccessTokenClaims, BoxFuture, MemorySecretStore, PersistentSessionStore, SESSIONS_KEY,
    };
    use provider::ProviderError;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    // -- fakes --

    enum Plan {
        Issue(IamSession),
        Reject,
    }

    /// Issuer scripted per refresh token, or per `token@account` for account
    /// switches. Optionally parks every account-less refresh on a gate so
    /// tests can act while a background exchange is in flight.
    #[derive(Default)]
    struct FakeIssuer {
        sign_in: StdMutex<Option<IamSession>>,
        plans: StdMutex<HashMap<String, Plan>>,
        refreshes: StdMutex<Vec<(String, Option<String>)>>,
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    impl FakeIssuer {
        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn signs_in(self, session: IamSession) -> Self {
            *self.sign_in.lock().unwrap() = Some(session);
            self
        }

        fn on_refresh(self, refresh_token: &str, plan: Plan) -> Self {
            self.plans
                .lock()
                .unwrap()
                .insert(refresh_token.to_string(), plan);
            self
        }

        fn refreshed_ids(&self) -> Vec<String> {
            self.refreshes
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    impl SessionIssuer for FakeIssuer {
        fn authenticate(&self) -> BoxFuture<'_, ibmcloud_iam::Result<IamSession>> {
            Box::pin(async move {
                self.sign_in
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or(ibmcloud_iam::Error::PasscodeCancelled)
            })
        }

        fn refresh<'a>(
            &'a self,
            session: &'a IamSession,
            account: Option<&'a Account>,
        ) -> BoxFuture<'a, ibmcloud_iam::Result<IamSession>> {
            Box::pin(async move {
                self.refreshes.lock().unwrap().push((
                    session.session_id.clone(),
                    account.map(|a| a.guid.clone()),
                ));
                if let (Some(gate), None) = (&self.gate, account) {
                    self.entered.notify_one();
                    gate.notified().await;
                }
                let plans = self.plans.lock().unwrap();
                let switched =
                    account.and_then(|a| plans.get(&format!("{}@{}", session.refresh_token, a.guid)));
                match switched.or_else(|| plans.get(&session.refresh_token)) {
                    Some(Plan::Issue(next)) => Ok(next.clone()),
                    _ => Err(ibmcloud_iam::Error::TokenEndpoint("invalid_grant".into())),
                }
            })
        }
    }

    /// Claims derived from the token text; tokens starting with "bad" fail.
    struct FakeIdentity;

    impl IdentityExtractor for FakeIdentity {
        fn extract(&self, access_token: &str) -> ibmcloud_iam::Result<AccessTokenClaims> {
            if access_token.starts_with("bad") {
                return Err(ibmcloud_iam::Error::InvalidToken);
            }
            Ok(AccessTokenClaims {
                id: format!("IBMid-{access_token}"),
                email: format!("{access_token}@example.com"),
                name: format!("User {access_token}"),
            })
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        initial: Vec<IamSession>,
        saves: StdMutex<Vec<Vec<IamSession>>>,
        fail: bool,
    }

    impl RecordingStore {
        fn with(initial: Vec<IamSession>) -> Self {
            Self {
                initial,
                ..Default::default()
            }
        }

        fn failing(initial: Vec<IamSession>) -> Self {
            Self {
                initial,
                fail: true,
                ..Default::default()
            }
        }

        fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }

        fn last_saved_ids(&self) -> Vec<String> {
            self.saves
                .lock()
                .unwrap()
                .last()
                .map(|s| s.iter().map(|s| s.session_id.clone()).collect())
                .unwrap_or_default()
        }
    }

    impl SessionStore for RecordingStore {
        fn load(&self) -> BoxFuture<'_, Vec<IamSession>> {
            Box::pin(async move { self.initial.clone() })
        }

        fn save<'a>(
            &'a self,
            sessions: &'a [IamSession],
        ) -> BoxFuture<'a, ibmcloud_iam::Result<()>> {
            Box::pin(async move {
                self.saves.lock().unwrap().push(sessions.to_vec());
                if self.fail {
                    return Err(ibmcloud_iam::Error::Io("disk full".into()));
                }
                Ok(())
            })
        }
    }

    // -- helpers --

    /// Session `id` with access token `at_<id>` and refresh token `rt_<id>`.
    fn session(id: &str, expires_in_secs: i64) -> IamSession {
        IamSession {
            access_token: format!("at_{id}"),
            refresh_token: format!("rt_{id}"),
            token_type: "Bearer".into(),
            expires_in: 3600,
            expiration: now_secs() + expires_in_secs,
            refresh_token_expiration: now_secs() + 86_400,
            scope: "ibm openid".into(),
            session_id: id.into(),
        }
    }

    /// The session `id` after a successful refresh.
    fn renewed(id: &str) -> IamSession {
        IamSession {
            access_token: format!("at_{id}_2"),
            refresh_token: format!("rt_{id}_2"),
            ..session(id, 3600)
        }
    }

    fn collaborators(issuer: Arc<FakeIssuer>, store: Arc<RecordingStore>) -> Collaborators {
        Collaborators {
            issuer,
            store,
            identity: Arc::new(FakeIdentity),
        }
    }

    /// Manager with persisted sessions loaded but no pass run and no timer.
    async fn restored(issuer: Arc<FakeIssuer>, store: Arc<RecordingStore>) -> Arc<SessionManager> {
        SessionManager::restore(collaborators(issuer, store), &ManagerConfig::default()).await
    }

    async fn ids(manager: &SessionManager) -> Vec<String> {
        manager
            .get_sessions(None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    fn team_account() -> Account {
        Account {
            guid: "g-team".into(),
            name: "Team".into(),
            ibmid: "IBMid-owner".into(),
        }
    }

    fn next_event(rx: &mut broadcast::Receiver<SessionsChangeEvent>) -> SessionsChangeEvent {
        rx.try_recv().expect("expected a change event")
    }

    // -- open --

    #[tokio::test]
    async fn open_restores_sessions_and_runs_first_check() {
        let issuer = Arc::new(FakeIssuer::default().on_refresh("rt_b", Plan::Issue(renewed("b"))));
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600), session("b", 30)]));

        let manager =
            SessionManager::open(collaborators(issuer.clone(), store.clone()), ManagerConfig::default())
                .await;

        assert_eq!(issuer.refreshed_ids(), vec!["b"]);
        let views = manager.get_sessions(None).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].access_token, "at_b_2");
        assert_eq!(store.save_count(), 1);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_store_opens_empty() {
        let secrets = Arc::new(MemorySecretStore::with_entry(SESSIONS_KEY, "{not json"));
        let manager = SessionManager::open(
            Collaborators {
                issuer: Arc::new(FakeIssuer::default()),
                store: Arc::new(PersistentSessionStore::new(secrets.clone())),
                identity: Arc::new(FakeIdentity),
            },
            ManagerConfig::default(),
        )
        .await;

        assert_eq!(manager.session_count().await, 0);
        // First pass overwrote the corrupt value with an empty list
        assert_eq!(secrets.peek(SESSIONS_KEY).as_deref(), Some("[]"));
        manager.close().await.unwrap();
    }

    // -- expiry check --

    #[tokio::test]
    async fn only_sessions_inside_threshold_are_refreshed() {
        let issuer = Arc::new(
            FakeIssuer::default()
                .on_refresh("rt_soon", Plan::Issue(renewed("soon")))
                .on_refresh("rt_expired", Plan::Issue(renewed("expired"))),
        );
        let store = Arc::new(RecordingStore::with(vec![
            session("soon", 30),
            session("late", 3600),
            session("expired", -10),
        ]));
        let manager = restored(issuer.clone(), store).await;

        let summary = manager.monitor_tokens().await.unwrap();

        assert_eq!(issuer.refreshed_ids(), vec!["soon", "expired"]);
        assert_eq!(
            summary,
            PassSummary {
                refreshed: 2,
                evicted: 0,
                skipped: false
            }
        );
    }

    #[tokio::test]
    async fn refresh_replaces_session_in_place() {
        let issuer = Arc::new(FakeIssuer::default().on_refresh("rt_b", Plan::Issue(renewed("b"))));
        let store = Arc::new(RecordingStore::with(vec![
            session("a", 3600),
            session("b", 10),
            session("c", 3600),
        ]));
        let manager = restored(issuer, store).await;
        let mut rx = manager.subscribe();

        manager.monitor_tokens().await.unwrap();

        assert_eq!(ids(&manager).await, vec!["a", "b", "c"]);
        match next_event(&mut rx) {
            SessionsChangeEvent::Changed(views) => {
                assert_eq!(views.len(), 1);
                assert_eq!(views[0].id, "b");
                assert_eq!(views[0].access_token, "at_b_2");
                assert_eq!(views[0].account.label, "User at_b_2");
            }
            other => panic!("expected changed, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn failed_refresh_evicts_only_that_session() {
        let issuer = Arc::new(
            FakeIssuer::default()
                .on_refresh("rt_a", Plan::Reject)
                .on_refresh("rt_b", Plan::Issue(renewed("b"))),
        );
        let store = Arc::new(RecordingStore::with(vec![
            session("a", 5),
            session("b", 5),
            session("c", 3600),
        ]));
        let manager = restored(issuer, store.clone()).await;
        let mut rx = manager.subscribe();

        let summary = manager.monitor_tokens().await.unwrap();

        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.evicted, 1);
        assert_eq!(ids(&manager).await, vec!["b", "c"]);

        // Removed carries the view from before the failure
        match next_event(&mut rx) {
            SessionsChangeEvent::Removed(views) => {
                assert_eq!(views.len(), 1);
                assert_eq!(views[0].id, "a");
                assert_eq!(views[0].access_token, "at_a");
            }
            other => panic!("expected removed, got {other:?}"),
        }
        assert_eq!(next_event(&mut rx).kind(), "changed");

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.last_saved_ids(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn missing_refresh_plan_is_evicted_not_retried() {
        let issuer = Arc::new(FakeIssuer::default());
        let store = Arc::new(RecordingStore::with(vec![session("a", -100)]));
        let manager = restored(issuer.clone(), store).await;

        manager.monitor_tokens().await.unwrap();
        manager.monitor_tokens().await.unwrap();

        assert_eq!(issuer.refreshed_ids(), vec!["a"]);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn pass_saves_once_with_nothing_to_refresh() {
        let issuer = Arc::new(FakeIssuer::default());
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600)]));
        let manager = restored(issuer.clone(), store.clone()).await;

        let summary = manager.monitor_tokens().await.unwrap();

        assert_eq!(summary, PassSummary::default());
        assert!(issuer.refreshed_ids().is_empty());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn failed_save_surfaces_but_keeps_mutations() {
        let issuer = Arc::new(FakeIssuer::default().on_refresh("rt_a", Plan::Issue(renewed("a"))));
        let store = Arc::new(RecordingStore::failing(vec![session("a", 5)]));
        let manager = restored(issuer, store).await;

        let err = manager.monitor_tokens().await.unwrap_err();

        assert!(matches!(err, Error::Store(_)));
        let views = manager.get_sessions(None).await.unwrap();
        assert_eq!(views[0].access_token, "at_a_2");
    }

    #[tokio::test]
    async fn refresh_issuing_existing_id_keeps_ids_unique() {
        let mut merged = renewed("c");
        merged.access_token = "at_merged".into();
        let issuer = Arc::new(FakeIssuer::default().on_refresh("rt_a", Plan::Issue(merged)));
        let store = Arc::new(RecordingStore::with(vec![
            session("a", 5),
            session("b", 3600),
            session("c", 3600),
        ]));
        let manager = restored(issuer, store).await;

        manager.monitor_tokens().await.unwrap();

        let views = manager.get_sessions(None).await.unwrap();
        let ids: Vec<_> = views.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(views[0].access_token, "at_merged");
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let gate = Arc::new(Notify::new());
        let issuer = Arc::new(
            FakeIssuer::gated(gate.clone()).on_refresh("rt_a", Plan::Issue(renewed("a"))),
        );
        let store = Arc::new(RecordingStore::with(vec![session("a", 5)]));
        let manager = restored(issuer.clone(), store.clone()).await;

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.monitor_tokens().await }
        });
        issuer.entered.notified().await;

        let second = manager.monitor_tokens().await.unwrap();
        assert!(second.skipped);

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.refreshed, 1);
        assert_eq!(issuer.refreshed_ids(), vec!["a"]);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn registry_stays_available_during_refresh() {
        let gate = Arc::new(Notify::new());
        let issuer = Arc::new(
            FakeIssuer::gated(gate.clone()).on_refresh("rt_a", Plan::Issue(renewed("a"))),
        );
        let store = Arc::new(RecordingStore::with(vec![session("a", 5), session("b", 3600)]));
        let manager = restored(issuer.clone(), store.clone()).await;
        let mut rx = manager.subscribe();

        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.monitor_tokens().await }
        });
        issuer.entered.notified().await;

        // Host calls proceed while the exchange is parked
        assert_eq!(ids(&manager).await, vec!["a", "b"]);
        manager.remove_session("a").await.unwrap();

        gate.notify_one();
        let summary = pass.await.unwrap().unwrap();

        // The late refresh result is discarded
        assert_eq!(summary.refreshed, 0);
        assert_eq!(ids(&manager).await, vec!["b"]);
        assert_eq!(next_event(&mut rx).kind(), "removed");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(store.last_saved_ids(), vec!["b"]);
    }

    #[tokio::test]
    async fn switch_during_background_refresh_is_not_reverted() {
        let gate = Arc::new(Notify::new());
        let mut background = renewed("a");
        background.access_token = "at_background".into();
        let mut team = renewed("a");
        team.access_token = "at_team".into();
        team.refresh_token = "rt_team".into();
        let issuer = Arc::new(
            FakeIssuer::gated(gate.clone())
                .on_refresh("rt_a", Plan::Issue(background))
                .on_refresh("rt_a@g-team", Plan::Issue(team)),
        );
        let store = Arc::new(RecordingStore::with(vec![session("a", 5)]));
        let manager = restored(issuer.clone(), store.clone()).await;
        let mut rx = manager.subscribe();

        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.monitor_tokens().await }
        });
        issuer.entered.notified().await;

        let view = manager.switch_account("a", &team_account()).await.unwrap();
        assert_eq!(view.access_token, "at_team");

        gate.notify_one();
        let summary = pass.await.unwrap().unwrap();

        assert_eq!(summary, PassSummary::default());
        let views = manager.get_sessions(None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].access_token, "at_team");
        match next_event(&mut rx) {
            SessionsChangeEvent::Changed(views) => assert_eq!(views[0].access_token, "at_team"),
            other => panic!("expected changed, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let saves = store.saves.lock().unwrap();
        assert_eq!(saves.last().unwrap()[0].access_token, "at_team");
    }

    #[tokio::test]
    async fn failed_background_refresh_keeps_newer_sign_in() {
        let gate = Arc::new(Notify::new());
        let mut again = renewed("a");
        again.access_token = "at_again".into();
        let issuer = Arc::new(
            FakeIssuer::gated(gate.clone())
                .signs_in(again)
                .on_refresh("rt_a", Plan::Reject),
        );
        let store = Arc::new(RecordingStore::with(vec![session("a", 5)]));
        let manager = restored(issuer.clone(), store.clone()).await;
        let mut rx = manager.subscribe();

        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.monitor_tokens().await }
        });
        issuer.entered.notified().await;
        manager.create_session(&[]).await.unwrap();

        gate.notify_one();
        let summary = pass.await.unwrap().unwrap();

        assert_eq!(summary.evicted, 0);
        let views = manager.get_sessions(None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].access_token, "at_again");
        assert_eq!(next_event(&mut rx).kind(), "changed");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(store.last_saved_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn session_removed_mid_pass_is_not_refreshed() {
        let gate = Arc::new(Notify::new());
        let issuer = Arc::new(
            FakeIssuer::gated(gate.clone())
                .on_refresh("rt_a", Plan::Issue(renewed("a")))
                .on_refresh("rt_b", Plan::Issue(renewed("b"))),
        );
        let store = Arc::new(RecordingStore::with(vec![session("a", 5), session("b", 5)]));
        let manager = restored(issuer.clone(), store).await;

        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.monitor_tokens().await }
        });
        issuer.entered.notified().await;
        manager.remove_session("b").await.unwrap();
        gate.notify_one();

        // A refresh for "b" would park on the gate forever
        let summary = tokio::time::timeout(Duration::from_secs(5), pass)
            .await
            .expect("pass parked on a removed session")
            .unwrap()
            .unwrap();

        assert_eq!(summary.refreshed, 1);
        assert_eq!(issuer.refreshed_ids(), vec!["a"]);
        assert_eq!(ids(&manager).await, vec!["a"]);
    }

    #[tokio::test]
    async fn extreme_persisted_expiration_does_not_block_open() {
        let mut ancient = session("ancient", 0);
        ancient.expiration = i64::MIN;
        let mut distant = session("distant", 0);
        distant.expiration = i64::MAX;
        let issuer = Arc::new(FakeIssuer::default());
        let store = Arc::new(RecordingStore::with(vec![ancient, distant]));

        let manager =
            SessionManager::open(collaborators(issuer.clone(), store.clone()), ManagerConfig::default())
                .await;

        // Long-expired session is refreshed (and evicted); far-future one is left alone
        assert_eq!(issuer.refreshed_ids(), vec!["ancient"]);
        assert_eq!(ids(&manager).await, vec!["distant"]);
        manager.close().await.unwrap();
    }

    // -- host operations --

    #[tokio::test]
    async fn create_session_appends_and_publishes_added() {
        let issuer = Arc::new(FakeIssuer::default().signs_in(session("new", 3600)));
        let store = Arc::new(RecordingStore::with(vec![session("old", 3600)]));
        let manager = restored(issuer, store.clone()).await;
        let mut rx = manager.subscribe();

        let view = manager
            .create_session(&["ignored".to_string()])
            .await
            .unwrap();

        assert_eq!(view.id, "new");
        assert_eq!(view.scopes, vec!["ibm", "openid"]);
        assert_eq!(view.account.id, "IBMid-at_new");
        assert_eq!(ids(&manager).await, vec!["old", "new"]);
        match next_event(&mut rx) {
            SessionsChangeEvent::Added(views) => assert_eq!(views, vec![view]),
            other => panic!("expected added, got {other:?}"),
        }
        assert_eq!(store.last_saved_ids(), vec!["old", "new"]);
    }

    #[tokio::test]
    async fn repeated_sign_in_replaces_existing_session() {
        let mut again = renewed("a");
        again.access_token = "at_again".into();
        let issuer = Arc::new(FakeIssuer::default().signs_in(again));
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600)]));
        let manager = restored(issuer, store).await;
        let mut rx = manager.subscribe();

        manager.create_session(&[]).await.unwrap();

        assert_eq!(manager.session_count().await, 1);
        assert_eq!(next_event(&mut rx).kind(), "changed");
    }

    #[tokio::test]
    async fn failed_sign_in_leaves_registry_untouched() {
        let issuer = Arc::new(FakeIssuer::default());
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600)]));
        let manager = restored(issuer, store.clone()).await;
        let mut rx = manager.subscribe();

        let err = manager.create_session(&[]).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Iam(ibmcloud_iam::Error::PasscodeCancelled)
        ));
        assert_eq!(manager.session_count().await, 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_new_token_is_rejected_before_mutation() {
        let mut bad = session("x", 3600);
        bad.access_token = "bad-token".into();
        let issuer = Arc::new(FakeIssuer::default().signs_in(bad));
        let manager = restored(issuer, Arc::new(RecordingStore::default())).await;

        let err = manager.create_session(&[]).await.unwrap_err();

        assert!(matches!(err, Error::Iam(ibmcloud_iam::Error::InvalidToken)));
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn get_sessions_filters_by_granted_scopes() {
        let mut narrow = session("narrow", 3600);
        narrow.scope = "ibm".into();
        let store = Arc::new(RecordingStore::with(vec![session("wide", 3600), narrow]));
        let manager = restored(Arc::new(FakeIssuer::default()), store).await;

        let openid = vec!["openid".to_string()];
        let filtered = manager.get_sessions(Some(openid.as_slice())).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "wide");

        assert_eq!(manager.get_sessions(Some(&[][..])).await.unwrap().len(), 2);
        assert_eq!(manager.get_sessions(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_unknown_session_is_not_found() {
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600)]));
        let manager = restored(Arc::new(FakeIssuer::default()), store).await;
        let mut rx = manager.subscribe();

        let err = manager.remove_session("missing").await.unwrap_err();

        assert_eq!(err.to_string(), "session with id missing not found");
        assert_eq!(manager.session_count().await, 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn remove_session_publishes_removed_without_saving() {
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600), session("b", 3600)]));
        let manager = restored(Arc::new(FakeIssuer::default()), store.clone()).await;
        let mut rx = manager.subscribe();

        manager.remove_session("a").await.unwrap();

        assert_eq!(ids(&manager).await, vec!["b"]);
        match next_event(&mut rx) {
            SessionsChangeEvent::Removed(views) => assert_eq!(views[0].id, "a"),
            other => panic!("expected removed, got {other:?}"),
        }
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn switch_account_rebinds_session() {
        let mut rebound = renewed("a");
        rebound.access_token = "at_team".into();
        let issuer = Arc::new(FakeIssuer::default().on_refresh("rt_a", Plan::Issue(rebound)));
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600)]));
        let manager = restored(issuer.clone(), store.clone()).await;
        let mut rx = manager.subscribe();

        let view = manager.switch_account("a", &team_account()).await.unwrap();

        assert_eq!(view.access_token, "at_team");
        assert_eq!(
            issuer.refreshes.lock().unwrap().as_slice(),
            &[("a".to_string(), Some("g-team".to_string()))]
        );
        assert_eq!(next_event(&mut rx).kind(), "changed");
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn failed_switch_keeps_session() {
        let issuer = Arc::new(FakeIssuer::default().on_refresh("rt_a", Plan::Reject));
        let store = Arc::new(RecordingStore::with(vec![session("a", 3600)]));
        let manager = restored(issuer, store).await;
        let mut rx = manager.subscribe();
        let account = Account {
            guid: "g".into(),
            name: "n".into(),
            ibmid: "i".into(),
        };

        let err = manager.switch_account("a", &account).await.unwrap_err();
        assert!(matches!(err, Error::Iam(ibmcloud_iam::Error::TokenEndpoint(_))));
        assert_eq!(ids(&manager).await, vec!["a"]);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let err = manager.switch_account("zzz", &account).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn provider_trait_maps_errors() {
        let manager = restored(
            Arc::new(FakeIssuer::default()),
            Arc::new(RecordingStore::default()),
        )
        .await;
        let provider: Arc<dyn AuthenticationProvider> = manager;

        let err = provider.remove_session("nope").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(id) if id == "nope"));

        let err = provider.create_session(&[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    // -- shutdown and timer --

    #[tokio::test]
    async fn close_is_idempotent_and_ends_event_stream() {
        let issuer = Arc::new(FakeIssuer::default().signs_in(session("a", 3600)));
        let store = Arc::new(RecordingStore::default());
        let manager =
            SessionManager::open(collaborators(issuer, store.clone()), ManagerConfig::default()).await;
        let mut rx = manager.subscribe();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(matches!(manager.subscribe().recv().await, Err(RecvError::Closed)));
        assert!(matches!(manager.create_session(&[]).await, Err(Error::Closed)));
        // open pass plus one persist per close
        assert_eq!(store.save_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_refreshes_expired_session_end_to_end() {
        let issuer = Arc::new(
            FakeIssuer::default()
                .signs_in(session("s1", -5))
                .on_refresh("rt_s1", Plan::Issue(renewed("s1"))),
        );
        let store = Arc::new(RecordingStore::default());
        let manager =
            SessionManager::open(collaborators(issuer, store.clone()), ManagerConfig::default()).await;
        let mut rx = manager.subscribe();

        manager.create_session(&[]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "added");

        // Paused clock auto-advances to the next tick
        let changed = rx.recv().await.unwrap();
        assert_eq!(changed.kind(), "changed");
        assert_eq!(changed.sessions()[0].access_token, "at_s1_2");

        manager.close().await.unwrap();
        let saves = store.saves.lock().unwrap();
        let last = saves.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].access_token, "at_s1_2");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_keeps_running_when_saves_fail() {
        // Refresh hands back a session that is still expired, so every pass refreshes it
        let issuer =
            Arc::new(FakeIssuer::default().on_refresh("rt_a", Plan::Issue(session("a", -5))));
        let store = Arc::new(RecordingStore::failing(vec![session("a", -5)]));
        let manager =
            SessionManager::open(collaborators(issuer.clone(), store), ManagerConfig::default()).await;

        tokio::time::sleep(CHECK_TOKEN_INTERVAL * 3 + Duration::from_secs(5)).await;

        // open pass plus three ticks
        assert_eq!(issuer.refreshed_ids().len(), 4);
        assert!(manager.close().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_manager_stops_timer() {
        let issuer = Arc::new(FakeIssuer::default());
        let store = Arc::new(RecordingStore::default());
        let manager =
            SessionManager::open(collaborators(issuer, store.clone()), ManagerConfig::default()).await;
        drop(manager);

        tokio::time::sleep(CHECK_TOKEN_INTERVAL * 2).await;

        assert_eq!(store.save_count(), 1);
    }
}
