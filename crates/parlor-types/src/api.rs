use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Role;

// -- JWT Claims --

/// Claims issued by the identity provider. Canonical definition lives here so
/// the REST middleware and the WebSocket upgrade decode the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// External subject; mapped to an internal user on first sight.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: usize,
}

// -- Generic --

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

// -- Users --

/// Query string for user lookups.
#[derive(Debug, Default, Deserialize)]
pub struct UserSearchQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<u32>,
}

// -- Workspaces --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateWorkspaceRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub role: Option<Role>,
}

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: Uuid,
    pub name: String,
    pub is_private: bool,
}

/// What the caller may do in a channel.
#[derive(Debug, Serialize, Deserialize)]
pub struct MembershipResponse {
    pub is_member: bool,
    pub can_read: bool,
    pub can_post: bool,
    /// `owner`, `member`, or `none`.
    pub role: String,
    pub is_private: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMessageRequest {
    pub text: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

/// Query string for message listing. `thread_root_id` stays a raw string so a
/// malformed value is reported as an invalid argument rather than a generic
/// extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    pub thread_root_id: Option<String>,
    #[serde(default)]
    pub root_only: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
