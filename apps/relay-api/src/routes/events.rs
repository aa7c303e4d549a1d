//! Server-Sent Events stream of a workspace's hub events.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::get;
use axum::Router;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{self, Instant, MissedTickBehavior};
use utoipa::IntoParams;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::hub::{Client, ClientHandle, Event, EventKind, Hub};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/workspaces/{workspace_id}/events", get(stream_events))
}

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// Resume cursor for clients that cannot set the `Last-Event-ID` header.
    pub last_event_id: Option<String>,
}

// ---------------------------------------------------------------------------
// GET /api/v1/workspaces/:workspace_id/events
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{workspace_id}/events",
    params(
        ("workspace_id" = String, Path, description = "Workspace to subscribe to"),
        EventsQuery,
    ),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String),
        (status = 401, description = "Not authenticated", body = crate::error::ApiErrorBody),
        (status = 500, description = "Replay log unavailable", body = crate::error::ApiErrorBody),
    ),
    tag = "Events"
)]
pub async fn stream_events(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, ApiError> {
    let hub = state.hub.clone();
    let (client, mut rx) = Client::new(&workspace_id, &user_id, hub.config().client_buffer_size);
    let handle = client.handle();

    // Armed before registering so a request dropped mid-registration still
    // removes the connection.
    let guard = UnregisterOnDrop {
        hub: hub.clone(),
        handle: Some(handle.clone()),
    };
    hub.register(client).await?;

    let cursor = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(query.last_event_id)
        .filter(|id| !id.is_empty());
    // The connection is live from here, so a later broadcast is queued even
    // if it also shows up in the replay page. Those are sent once.
    let replay = match &cursor {
        Some(since) => hub.get_events_since(&workspace_id, since).await?,
        None => Vec::new(),
    };
    let replayed: HashSet<String> = replay.iter().map(|event| event.id.clone()).collect();
    tracing::debug!(
        %workspace_id,
        %user_id,
        client_id = %handle.id,
        replayed = replay.len(),
        "event stream opened"
    );

    let heartbeat = state.config.heartbeat_interval;
    let stream = async_stream::stream! {
        let _guard = guard;

        yield to_sse(&Event::new(
            EventKind::Connected,
            serde_json::json!({ "client_id": handle.id }),
        ));
        yield to_sse(&Event::new(
            EventKind::PresenceInitial,
            serde_json::json!({ "user_ids": hub.connected_user_ids(&workspace_id) }),
        ));
        for event in replay {
            yield to_sse(&event);
        }

        let mut ticker = time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let next = tokio::select! {
                _ = handle.disconnected() => None,
                event = rx.recv() => event,
                _ = ticker.tick() => Some(Event::new(EventKind::Heartbeat, Value::Null)),
            };
            let Some(event) = next else { break };
            if event.has_id() && replayed.contains(&event.id) {
                continue;
            }
            yield to_sse(&event);
        }
    };

    Ok(Sse::new(stream))
}

/// One SSE frame: `event:` is the kind, `id:` the event ID (when assigned),
/// `data:` the JSON event record.
fn to_sse(event: &Event) -> Result<SseEvent, axum::Error> {
    let frame = SseEvent::default().event(event.kind.as_str()).json_data(event)?;
    Ok(if event.has_id() {
        frame.id(&event.id)
    } else {
        frame
    })
}

/// Unregisters the connection once the response stream is dropped.
struct UnregisterOnDrop {
    hub: Arc<Hub>,
    handle: Option<ClientHandle>,
}

impl Drop for UnregisterOnDrop {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let hub = self.hub.clone();
        tokio::spawn(async move {
            if let Err(err) = hub.unregister(handle).await {
                tracing::debug!(%err, "unregister after stream end skipped");
            }
        });
    }
}
