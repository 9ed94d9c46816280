use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const DIAL_ATTEMPTS: &str = "proxee_dial_attempts_total";
pub const DIAL_FAILURES: &str = "proxee_dial_failures_total";
pub const REGISTRATIONS: &str = "proxee_registrations_total";
pub const REGISTRATION_FAILURES: &str = "proxee_registration_failures_total";
pub const HEARTBEATS: &str = "proxee_heartbeats_total";
pub const HEARTBEAT_FAILURES: &str = "proxee_heartbeat_failures_total";
pub const STREAMS_ACCEPTED: &str = "proxee_streams_accepted_total";
pub const STREAM_ERRORS: &str = "proxee_stream_errors_total";
pub const CONNECTED: &str = "proxee_connected";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
