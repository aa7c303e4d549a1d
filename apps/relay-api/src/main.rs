use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::hub::{EventStore, Hub, MembershipSource, PgEventStore, PgMembershipSource};
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    if let Err(err) = config.validate() {
        tracing::error!(%err, "refusing to start");
        std::process::exit(1);
    }
    let port = config.port;

    let metrics = relay_api::metrics::install_recorder();

    let db = relay_api::db::pool::connect(&config.database_url, config.database_pool_size);
    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(db.clone()));
    let members: Arc<dyn MembershipSource> = Arc::new(PgMembershipSource::new(db));

    let shutdown = CancellationToken::new();
    let hub = Hub::start(config.hub.clone(), store, members, &shutdown);

    tracing::info!(
        retention = ?config.hub.event_retention,
        cleanup_interval = ?config.hub.cleanup_interval,
        client_buffer = config.hub.client_buffer_size,
        "relay-api configured"
    );

    let state = AppState {
        hub,
        config: Arc::new(config),
        metrics,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("ctrl-c handler unavailable");
            }
            tracing::info!("shutting down");
            signal.cancel();
        })
        .await
        .expect("server error");
}
