use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parlor_types::api::{AddMemberRequest, CreateWorkspaceRequest, CreatedResponse, OkResponse};

use crate::auth::{AppState, AuthUser};
use crate::error::ApiResult;

pub async fn create_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<impl IntoResponse> {
    let workspace = state.directory.create_workspace(user.id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: workspace.id })))
}

pub async fn list_workspaces(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.directory.list_workspaces(user.id).await?))
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(ws_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .directory
        .add_workspace_member(user.id, ws_id, req.user_id, req.role.unwrap_or_default())
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn list_members(
    State(state): State<AppState>,
    Path(ws_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.directory.list_workspace_members(user.id, ws_id).await?))
}
