use std::time::Duration;

/// Relay API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Maximum pooled database connections.
    pub database_pool_size: usize,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// SSE keep-alive interval.
    pub heartbeat_interval: Duration,
    pub hub: HubConfig,
}

/// Tunables for the event distribution hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long persisted events stay replayable. Zero disables cleanup.
    pub event_retention: Duration,
    /// How often expired events are purged. Zero disables cleanup.
    pub cleanup_interval: Duration,
    /// Outbound queue capacity per connection.
    pub client_buffer_size: usize,
    /// Capacity of each control-loop intake (register / unregister).
    pub intake_capacity: usize,
    /// Maximum events returned by one replay request.
    pub replay_page_size: usize,
    /// Backlog of persisted copies awaiting the replay log writer.
    pub persist_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            client_buffer_size: 256,
            intake_capacity: 256,
            replay_page_size: 100,
            persist_queue_capacity: 1024,
        }
    }
}

impl HubConfig {
    /// Whether the retention timer (and the startup purge) should run.
    pub fn cleanup_enabled(&self) -> bool {
        !self.event_retention.is_zero() && !self.cleanup_interval.is_zero()
    }
}

/// Every constraint violated by a loaded configuration.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {}", .0.join("; "))]
pub struct ConfigError(pub Vec<String>);

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const MIN_CLIENT_BUFFER_SIZE: usize = 16;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = HubConfig::default();
        Self {
            database_url: required_var("DATABASE_URL"),
            database_pool_size: parsed_var("DATABASE_POOL_SIZE").unwrap_or(20),
            port: parsed_var("PORT").unwrap_or(4100),
            heartbeat_interval: secs_var("SSE_HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(Duration::from_secs(30)),
            hub: HubConfig {
                event_retention: secs_var("EVENT_RETENTION_SECS")
                    .unwrap_or(defaults.event_retention),
                cleanup_interval: secs_var("EVENT_CLEANUP_INTERVAL_SECS")
                    .unwrap_or(defaults.cleanup_interval),
                client_buffer_size: parsed_var("SSE_CLIENT_BUFFER_SIZE")
                    .unwrap_or(defaults.client_buffer_size),
                ..defaults
            },
        }
    }

    /// Check value ranges, reporting every violation at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();
        if self.heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
            errs.push("sse heartbeat interval must be at least 5s".to_string());
        }
        if self.hub.client_buffer_size < MIN_CLIENT_BUFFER_SIZE {
            errs.push(format!(
                "sse client buffer size must be at least {MIN_CLIENT_BUFFER_SIZE}"
            ));
        }
        if self.database_pool_size == 0 {
            errs.push("database pool size must be at least 1".to_string());
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError(errs))
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name).map(Duration::from_secs)
}
