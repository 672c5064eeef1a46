//! IBM Cloud session lifecycle
//!
//! Owns the authoritative in-memory list of IAM sessions and keeps it fresh.
//! The store is a best-effort durable mirror, read once at open and written
//! after every pass and mutation.
//!
//! Session lifecycle:
//! 1. `SessionManager::open` restores persisted sessions, runs one expiry check, arms the timer
//! 2. Host calls `create_session` → passcode flow → session appended, `added` event
//! 3. Every `CHECK_TOKEN_INTERVAL` the monitor refreshes sessions expiring within a minute
//! 4. Refresh success → session replaced in place, `changed` event
//! 5. Refresh failure → session evicted, `removed` event carrying the pre-failure view
//! 6. `close` cancels the timer, persists once more, and ends the event stream

pub mod convert;
pub mod error;
pub mod manager;
pub mod monitor;

pub use convert::{SessionConverter, to_external_session};
pub use error::{Error, Result};
pub use manager::{
    CHECK_TOKEN_INTERVAL, Collaborators, ManagerConfig, PassSummary, REFRESH_THRESHOLD_SECS,
    SessionManager,
};
pub use monitor::spawn_monitor_task;
