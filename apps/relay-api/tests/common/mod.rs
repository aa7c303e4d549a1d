#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_api::auth::AuthUser;
use relay_api::config::{Config, HubConfig};
use relay_api::hub::{Event, EventKind, Hub, MemoryEventStore, MemoryMembershipSource};
use relay_api::AppState;
use relay_common::id::{prefix, prefixed_ulid};

/// Header the test session layer turns into an [`AuthUser`].
pub const TEST_USER_HEADER: &str = "x-test-user";

/// A running hub over in-memory stores. Cancels the hub's tasks on drop.
pub struct TestHub {
    pub state: AppState,
    pub store: Arc<MemoryEventStore>,
    pub members: Arc<MemoryMembershipSource>,
    pub shutdown: CancellationToken,
}

impl TestHub {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/relay_test".to_string(),
        database_pool_size: 1,
        port: 0,
        heartbeat_interval: Duration::from_secs(30),
        hub: HubConfig {
            client_buffer_size: 64,
            ..HubConfig::default()
        },
    }
}

/// Start a hub with the default test configuration.
pub fn test_hub() -> TestHub {
    test_hub_with(test_config(), Arc::new(MemoryEventStore::new()))
}

/// Start a hub with a custom configuration and a pre-seeded store.
pub fn test_hub_with(config: Config, store: Arc<MemoryEventStore>) -> TestHub {
    let members = Arc::new(MemoryMembershipSource::new());
    let shutdown = CancellationToken::new();
    let hub = Hub::start(config.hub.clone(), store.clone(), members.clone(), &shutdown);

    TestHub {
        state: AppState {
            hub,
            config: Arc::new(config),
            metrics: None,
        },
        store,
        members,
        shutdown,
    }
}

/// The service router behind a session layer that trusts [`TEST_USER_HEADER`].
pub fn test_app(state: AppState) -> Router {
    relay_api::routes::router()
        .layer(middleware::from_fn(test_session))
        .with_state(state)
}

async fn test_session(mut req: Request, next: Next) -> Response {
    let user_id = req
        .headers()
        .get(TEST_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if let Some(user_id) = user_id {
        req.extensions_mut().insert(AuthUser { user_id });
    }
    next.run(req).await
}

pub fn user_id() -> String {
    prefixed_ulid(prefix::USER)
}

pub fn workspace_id() -> String {
    prefixed_ulid(prefix::WORKSPACE)
}

pub fn channel_id() -> String {
    prefixed_ulid(prefix::CHANNEL)
}

pub fn message(text: &str) -> Event {
    Event::new(EventKind::MessageNew, serde_json::json!({ "text": text }))
}

/// Next event on a connection's queue, failing the test after two seconds.
pub async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection queue closed")
}

/// Read events up to and including the first one matching `stop`.
pub async fn events_until(
    rx: &mut mpsc::Receiver<Event>,
    stop: impl Fn(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn is_presence(event: &Event, user_id: &str, status: &str) -> bool {
    event.kind == EventKind::PresenceChanged
        && event.data["user_id"] == user_id
        && event.data["status"] == status
}

/// Poll `check` every few milliseconds until it holds, for up to two seconds.
pub async fn wait_until(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
