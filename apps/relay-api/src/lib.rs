pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod routes;

use std::sync::Arc;

use config::Config;
use hub::Hub;
use metrics_exporter_prometheus::PrometheusHandle;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
    /// Absent when another recorder was installed first (e.g. in tests).
    pub metrics: Option<PrometheusHandle>,
}
