//! Periodic expiry check
//!
//! Runs `SessionManager::monitor_tokens` every interval until the manager is
//! closed or dropped. The task holds only a weak reference so it never keeps
//! the manager alive on its own.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::manager::SessionManager;

/// Spawn the background expiry check.
///
/// The first tick fires one `interval` after spawning: `open` has already run
/// a pass. A pass that outlasts the interval causes the missed ticks to be
/// skipped rather than bunched up.
pub fn spawn_monitor_task(
    manager: Weak<SessionManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                debug!("session manager dropped, stopping token monitor");
                break;
            };
            if let Err(e) = manager.monitor_tokens().await {
                error!(error = %e, "error during token check");
            }
        }
    })
}
