//! Typing indicators, fanned out to a channel's members.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::hub::{Event, EventKind};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/workspaces/{workspace_id}/typing/start", post(typing_start))
        .route("/workspaces/{workspace_id}/typing/stop", post(typing_stop))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TypingRequest {
    pub channel_id: String,
}

// ---------------------------------------------------------------------------
// POST /api/v1/workspaces/:workspace_id/typing/start
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{workspace_id}/typing/start",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    request_body = TypingRequest,
    responses(
        (status = 204, description = "Typing indicator sent"),
        (status = 400, description = "Missing channel", body = crate::error::ApiErrorBody),
        (status = 401, description = "Not authenticated", body = crate::error::ApiErrorBody),
    ),
    tag = "Typing"
)]
pub async fn typing_start(
    user: AuthUser,
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(body): Json<TypingRequest>,
) -> Result<StatusCode, ApiError> {
    send_typing(&state, &workspace_id, &user, body, EventKind::TypingStart).await
}

// ---------------------------------------------------------------------------
// POST /api/v1/workspaces/:workspace_id/typing/stop
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{workspace_id}/typing/stop",
    params(("workspace_id" = String, Path, description = "Workspace ID")),
    request_body = TypingRequest,
    responses(
        (status = 204, description = "Typing indicator cleared"),
        (status = 400, description = "Missing channel", body = crate::error::ApiErrorBody),
        (status = 401, description = "Not authenticated", body = crate::error::ApiErrorBody),
    ),
    tag = "Typing"
)]
pub async fn typing_stop(
    user: AuthUser,
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(body): Json<TypingRequest>,
) -> Result<StatusCode, ApiError> {
    send_typing(&state, &workspace_id, &user, body, EventKind::TypingStop).await
}

async fn send_typing(
    state: &AppState,
    workspace_id: &str,
    user: &AuthUser,
    body: TypingRequest,
    kind: EventKind,
) -> Result<StatusCode, ApiError> {
    let channel_id = body.channel_id.trim();
    if channel_id.is_empty() {
        return Err(ApiError::bad_request("channel_id is required"));
    }

    let event = Event::new(
        kind,
        serde_json::json!({
            "user_id": user.user_id,
            "channel_id": channel_id,
        }),
    );
    state
        .hub
        .broadcast_to_channel(workspace_id, channel_id, event)
        .await;

    Ok(StatusCode::NO_CONTENT)
}
