//! Prometheus metrics exposition
//!
//! The session core records:
//!
//! - `ibmcloud_session_refresh_total` (counter): label `outcome` (`refreshed`, `evicted`)
//! - `ibmcloud_sessions_active` (gauge): sessions in the registry
//!
//! This module installs the recorder and describes those series.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REFRESH_TOTAL: &str = "ibmcloud_session_refresh_total";
pub const SESSIONS_ACTIVE: &str = "ibmcloud_sessions_active";

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before the session manager opens so the first pass is counted.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

/// Attach help text to the series the session core emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        REFRESH_TOTAL,
        "Sessions processed by the background expiry check, by outcome"
    );
    metrics::describe_gauge!(SESSIONS_ACTIVE, "Sessions currently held in the registry");
}
