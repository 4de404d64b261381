use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde_json::json;

use crate::auth::AppState;
use crate::middleware::require_auth;
use crate::{channels, messages, users, workspaces};

/// REST surface. The WebSocket upgrade is mounted by the server binary.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(users::me))
        .route("/users/search", get(users::search_users))
        .route(
            "/workspaces",
            post(workspaces::create_workspace).get(workspaces::list_workspaces),
        )
        .route(
            "/workspaces/{ws_id}/members",
            post(workspaces::add_member).get(workspaces::list_members),
        )
        .route(
            "/workspaces/{ws_id}/channels",
            post(channels::create_channel).get(channels::list_channels),
        )
        .route(
            "/workspaces/{ws_id}/channels/{channel_id}/join",
            post(channels::join_channel),
        )
        .route("/channels/{channel_id}/members", post(channels::add_member))
        .route("/channels/{channel_id}/members/search", get(channels::search_members))
        .route("/channels/{channel_id}/membership", get(channels::membership))
        .route(
            "/channels/{channel_id}/messages",
            post(messages::create_message).get(messages::list_messages),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .route("/health", get(|| async { Json(json!({ "ok": true })) }))
        .merge(protected)
}
