use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on a single page of messages.
pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Upper bound on user lookup results.
pub const MAX_SEARCH_RESULTS: u32 = 50;
pub const DEFAULT_SEARCH_RESULTS: u32 = 20;

/// Membership role, shared by workspace and channel memberships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    #[default]
    Member,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "member" => Ok(Self::Member),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Public profile returned by user lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Case-insensitive substring match on email or display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSearch {
    pub needle: String,
    pub limit: u32,
}

impl UserSearch {
    /// `None` for a blank query. `limit` is clamped to `1..=MAX_SEARCH_RESULTS`.
    pub fn new(query: &str, limit: Option<u32>) -> Option<Self> {
        let needle = query.trim();
        if needle.is_empty() {
            return None;
        }
        Some(Self {
            needle: needle.to_string(),
            limit: limit.unwrap_or(DEFAULT_SEARCH_RESULTS).clamp(1, MAX_SEARCH_RESULTS),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMember {
    pub user_id: Uuid,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub is_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a channel row that access decisions need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMeta {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub is_private: bool,
}

/// A persisted chat message. Immutable once created.
///
/// `thread_root_id` always names the top-level ancestor of a reply, so a
/// whole thread is retrievable with a single equality filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A message ready to be inserted; the store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub workspace_id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub parent_id: Option<Uuid>,
    pub thread_root_id: Option<Uuid>,
}

/// Which messages of a channel a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageScope {
    /// Every message in the channel.
    Channel,
    /// Top-level posts only (`thread_root_id IS NULL`).
    RootsOnly,
    /// Replies sharing the given thread root.
    Thread(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFilter {
    pub scope: MessageScope,
    pub limit: u32,
    pub offset: u32,
}

impl MessageFilter {
    /// Builds a filter from loose listing parameters. A thread root takes
    /// precedence over `root_only`; `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(thread_root_id: Option<Uuid>, root_only: bool, limit: Option<u32>, offset: Option<u32>) -> Self {
        let scope = match (thread_root_id, root_only) {
            (Some(root), _) => MessageScope::Thread(root),
            (None, true) => MessageScope::RootsOnly,
            (None, false) => MessageScope::Channel,
        };

        Self {
            scope,
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self::new(None, false, None, None)
    }
}
