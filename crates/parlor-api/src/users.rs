use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};

use parlor_types::api::UserSearchQuery;

use crate::auth::{AppState, AuthUser};
use crate::error::ApiResult;

/// The caller's own profile, as provisioned from their token.
pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.directory.current_user(user.id).await?))
}

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<UserSearchQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.directory.search_users(&query.q, query.limit).await?))
}
