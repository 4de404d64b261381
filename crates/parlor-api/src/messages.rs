use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parlor_types::api::{CreateMessageRequest, ListMessagesQuery};
use parlor_types::error::{Error, Result};
use parlor_types::models::MessageFilter;

use crate::auth::{AppState, AuthUser};
use crate::error::ApiResult;

/// A malformed `thread_root_id` is an invalid argument, not a silent
/// fallback to the channel timeline.
pub fn filter_from_query(query: ListMessagesQuery) -> Result<MessageFilter> {
    let thread_root_id = query
        .thread_root_id
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| raw.parse::<Uuid>().map_err(|_| Error::invalid("invalid thread_root_id")))
        .transpose()?;

    Ok(MessageFilter::new(
        thread_root_id,
        query.root_only,
        query.limit,
        query.offset,
    ))
}

pub async fn create_message(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .messages
        .create(user.id, channel_id, req.text, req.parent_id)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let filter = filter_from_query(query)?;
    let messages = state.messages.list(user.id, channel_id, filter).await?;
    Ok(Json(messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::models::{MAX_PAGE_SIZE, MessageScope};

    #[test]
    fn query_maps_to_filter() {
        let root = Uuid::new_v4();
        let filter = filter_from_query(ListMessagesQuery {
            thread_root_id: Some(root.to_string()),
            root_only: true,
            limit: Some(10_000),
            offset: Some(5),
        })
        .unwrap();
        assert_eq!(filter.scope, MessageScope::Thread(root));
        assert_eq!(filter.limit, MAX_PAGE_SIZE);
        assert_eq!(filter.offset, 5);

        let filter = filter_from_query(ListMessagesQuery {
            root_only: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(filter.scope, MessageScope::RootsOnly);
    }

    #[test]
    fn malformed_thread_root_is_rejected() {
        let err = filter_from_query(ListMessagesQuery {
            thread_root_id: Some("not-a-uuid".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
