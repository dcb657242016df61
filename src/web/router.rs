use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use super::app_state::AppState;
use super::rest_api;
use super::ws_handler::ws_upgrade;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Build the axum router with all HTTP and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/register", post(rest_api::register))
        .route("/api/login", post(rest_api::login))
        .route("/api/groups", post(rest_api::create_group))
        .route(
            "/api/groups/{name}/members",
            post(rest_api::add_group_member).get(rest_api::get_group_members),
        )
        .route(
            "/api/groups/{name}/messages",
            get(rest_api::get_group_history),
        )
        .route("/api/users/online", get(rest_api::get_online_users))
        .route("/api/users/search", get(rest_api::search_users))
        .route("/api/users/{name}/groups", get(rest_api::get_user_groups))
        .route("/api/messages/private", get(rest_api::get_private_history))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown` is cancelled. Open
/// WebSocket sessions observe the same token and retire themselves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
