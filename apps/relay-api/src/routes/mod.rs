pub mod events;
pub mod health;
pub mod typing;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/v1", events::router().merge(typing::router()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Events
        events::stream_events,
        // Typing
        typing::typing_start,
        typing::typing_stop,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            // Route request/response types
            health::HealthResponse,
            typing::TypingRequest,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Events", description = "Real-time event stream"),
        (name = "Typing", description = "Typing indicators"),
    )
)]
pub struct ApiDoc;
