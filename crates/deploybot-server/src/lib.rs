pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::ControllerConfig;
pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(routes::health::health))
        // Agents (worker-facing)
        .route("/v1/agents/register", post(routes::agents::register))
        .route(
            "/v1/agents/{agent_id}/heartbeat",
            post(routes::agents::heartbeat),
        )
        .route(
            "/v1/agents/{agent_id}/jobs/{job_id}",
            post(routes::agents::ack),
        )
        .route(
            "/v1/agents/{agent_id}/jobs/{job_id}/logs",
            post(routes::agents::post_logs),
        )
        // Jobs
        .route(
            "/v1/jobs",
            post(routes::jobs::create).get(routes::jobs::list),
        )
        .route(
            "/v1/jobs/{job_id}",
            get(routes::jobs::get).delete(routes::jobs::cancel),
        )
        .route(
            "/v1/jobs/{job_id}/logs/stream",
            get(routes::jobs::stream_logs),
        )
        // Hosts
        .route("/v1/hosts", get(routes::hosts::list))
        // Webhooks
        .route("/v1/webhooks/github", post(routes::webhooks::github))
        // Chat persistence
        .route(
            "/v1/chat/sessions",
            post(routes::chat::create_session).get(routes::chat::list_sessions),
        )
        .route(
            "/v1/chat/sessions/{session_id}",
            get(routes::chat::get_session).delete(routes::chat::delete_session),
        )
        .route(
            "/v1/chat/sessions/{session_id}/archive",
            post(routes::chat::archive_session),
        )
        .route(
            "/v1/chat/sessions/{session_id}/unarchive",
            post(routes::chat::unarchive_session),
        )
        .route(
            "/v1/chat/sessions/{session_id}/messages",
            get(routes::chat::list_messages).post(routes::chat::post_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the controller on the configured port.
pub async fn serve(config: ControllerConfig) -> anyhow::Result<()> {
    let port = config.port;
    let state = AppState::new(config)?;
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("deploybot controller listening on http://localhost:{port}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the controller on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so
/// the caller can read the actual port first (useful when `port = 0` and the
/// OS picks a free one).
pub async fn serve_on(
    config: ControllerConfig,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let state = AppState::new(config)?;
    let app = build_router(state);

    tracing::info!("deploybot controller listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
