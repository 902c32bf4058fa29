use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use session_engine::EngineContext;
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod realtime;
mod scheduler;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let engine = EngineContext::new(storage, settings.media_grant())
        .with_windows(settings.windows())
        .with_end_requires_host(settings.end_requires_host);

    let state = Arc::new(AppState::new(engine));
    let _sweeper = scheduler::spawn_sweeper(state.engine.clone(), settings.sweep_interval());
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/calls", post(api::start_call))
        .route("/calls/:session_id", get(api::get_call))
        .route(
            "/conversations/:conversation_id/calls/live",
            get(api::live_call),
        )
        .route("/calls/:session_id/invite", post(api::invite))
        .route("/calls/:session_id/ring", post(api::ring))
        .route("/calls/:session_id/join", post(api::join))
        .route("/calls/:session_id/reject", post(api::reject_call))
        .route("/calls/:session_id/leave", post(api::leave))
        .route("/calls/:session_id/end", post(api::end))
        .route("/sweep", post(api::sweep))
        .route("/realtime", get(realtime::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
