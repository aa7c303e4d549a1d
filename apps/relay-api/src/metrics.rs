//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder (global).
///
/// Must be called once at startup before any metrics are recorded; returns
/// `None` if another recorder is already installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            tracing::info!("prometheus metrics recorder installed");
            Some(handle)
        }
        Err(err) => {
            tracing::warn!(%err, "metrics recorder not installed");
            None
        }
    }
}

/// Live hub connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Events broadcast (counter, labels: scope).
pub const EVENTS_BROADCAST_TOTAL: &str = "relay_events_broadcast_total";
/// Events dropped because a connection's outbound queue was full (counter).
pub const EVENTS_DROPPED_TOTAL: &str = "relay_events_dropped_total";
/// Persisted copies dropped because the replay log writer fell behind (counter).
pub const EVENTS_PERSIST_DROPPED_TOTAL: &str = "relay_events_persist_dropped_total";
