//! Durable session storage
//!
//! The session list is mirrored as one JSON string under a fixed key in a
//! string-keyed `SecretStore`. Reading is forgiving: a missing, unparsable or
//! mis-shaped entry yields an empty list so a corrupted store never blocks
//! startup. Writing always replaces the whole entry.
//!
//! `FileSecretStore` keeps all entries in one JSON object file. All writes use
//! atomic temp-file + rename, and a tokio Mutex serializes concurrent writers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::BoxFuture;
use crate::constants::SESSIONS_KEY;
use crate::error::{Error, Result};
use crate::session::IamSession;

/// String-keyed secret storage provided by the host.
pub trait SecretStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>>;
}

/// Persistence of the session list.
pub trait SessionStore: Send + Sync {
    /// Read the persisted sessions. Never fails; bad data reads as empty.
    fn load(&self) -> BoxFuture<'_, Vec<IamSession>>;

    /// Overwrite the persisted sessions with `sessions`.
    fn save<'a>(&'a self, sessions: &'a [IamSession]) -> BoxFuture<'a, Result<()>>;
}

/// `SessionStore` backed by a `SecretStore` entry under [`SESSIONS_KEY`].
pub struct PersistentSessionStore {
    secrets: Arc<dyn SecretStore>,
}

impl PersistentSessionStore {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }
}

impl SessionStore for PersistentSessionStore {
    fn load(&self) -> BoxFuture<'_, Vec<IamSession>> {
        Box::pin(async move {
            let stored = match self.secrets.get(SESSIONS_KEY).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!("no stored sessions");
                    return Vec::new();
                }
                Err(e) => {
                    error!(error = %e, "error reading stored sessions");
                    return Vec::new();
                }
            };

            match parse_sessions(&stored) {
                Ok(sessions) => {
                    info!(sessions = sessions.len(), "restored sessions");
                    sessions
                }
                Err(e) => {
                    error!(error = %e, "error parsing stored sessions");
                    Vec::new()
                }
            }
        })
    }

    fn save<'a>(&'a self, sessions: &'a [IamSession]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(sessions)
                .map_err(|e| Error::Io(format!("serializing sessions: {e}")))?;
            self.secrets.store(SESSIONS_KEY, json).await?;
            debug!(sessions = sessions.len(), "persisted sessions");
            Ok(())
        })
    }
}

/// Parse and validate a stored session list, dropping duplicate ids.
fn parse_sessions(stored: &str) -> Result<Vec<IamSession>> {
    let value: serde_json::Value = serde_json::from_str(stored).map_err(|e| {
        error!(error = %e, "stored sessions are not JSON");
        Error::InvalidSessions
    })?;
    let sessions: Vec<IamSession> = serde_json::from_value(value).map_err(|e| {
        error!(error = %e, "invalid sessions");
        Error::InvalidSessions
    })?;

    let mut seen = HashSet::new();
    Ok(sessions
        .into_iter()
        .filter(|s| {
            let fresh = seen.insert(s.session_id.clone());
            if !fresh {
                warn!(session_id = %s.session_id, "dropping duplicate stored session");
            }
            fresh
        })
        .collect())
}

/// Thread-safe secret file. Entries are kept in memory and flushed on every store.
pub struct FileSecretStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileSecretStore {
    /// Load secrets from `path`, creating the file as `{}` if it doesn't exist.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading secret file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Io(format!("parsing secret file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded secret file");
            entries
        } else {
            info!(path = %path.display(), "secret file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl SecretStore for FileSecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), value);
            write_atomic(&self.path, &state).await
        })
    }
}

/// In-memory secret store for embedding and tests.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one entry.
    pub fn with_entry(key: &str, value: &str) -> Self {
        let store = Self::default();
        store.put(key, value);
        store
    }

    /// Synchronous read, for inspection.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.lock().insert(key.to_string(), value.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SecretStore for MemorySecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        let value = self.peek(key);
        Box::pin(async move { Ok(value) })
    }

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        self.lock().insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }
}

/// Write secrets to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Io(format!("serializing secrets: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".secrets.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp secret file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting secret file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp secret file: {e}")))?;

    debug!(path = %path.display(), "persisted secret file");
    Ok(())
}
