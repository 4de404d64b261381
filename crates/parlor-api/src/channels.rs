use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parlor_types::api::{
    AddMemberRequest, ChannelSummary, CreateChannelRequest, CreatedResponse, MembershipResponse,
    OkResponse, UserSearchQuery,
};

use crate::auth::{AppState, AuthUser};
use crate::error::ApiResult;

pub async fn create_channel(
    State(state): State<AppState>,
    Path(ws_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult<impl IntoResponse> {
    let channel = state
        .directory
        .create_channel(user.id, ws_id, &req.name, req.is_private)
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: channel.id })))
}

pub async fn list_channels(
    State(state): State<AppState>,
    Path(ws_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let channels: Vec<ChannelSummary> = state
        .directory
        .list_channels(user.id, ws_id)
        .await?
        .into_iter()
        .map(|c| ChannelSummary {
            id: c.id,
            name: c.name,
            is_private: c.is_private,
        })
        .collect();
    Ok(Json(channels))
}

pub async fn join_channel(
    State(state): State<AppState>,
    Path((ws_id, channel_id)): Path<(Uuid, Uuid)>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    state.directory.join_channel(user.id, ws_id, channel_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .directory
        .add_channel_member(user.id, channel_id, req.user_id, req.role.unwrap_or_default())
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

/// Workspace members not yet in the channel, for the invite picker.
pub async fn search_members(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<UserSearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let candidates = state
        .directory
        .search_invitees(user.id, channel_id, &query.q, query.limit)
        .await?;
    Ok(Json(candidates))
}

pub async fn membership(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let (channel, access) = state.directory.channel_access(user.id, channel_id).await?;
    Ok(Json(MembershipResponse {
        is_member: access.is_member(),
        can_read: access.can_read,
        can_post: access.can_write,
        role: access.role.map_or("none", |r| r.as_str()).to_string(),
        is_private: channel.is_private,
    }))
}
