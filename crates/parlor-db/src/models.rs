//! Database row types. These map directly to SQLite rows and are converted
//! into `parlor_types` models at the crate boundary, keeping the DB layer
//! independent of the wire types.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parlor_types::models::{
    Channel, ChannelMeta, Message, Role, User, UserSummary, Workspace, WorkspaceMember,
};

pub struct UserRow {
    pub id: String,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub created_at: String,
}

pub struct UserSummaryRow {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

pub struct WorkspaceRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

pub struct WorkspaceMemberRow {
    pub user_id: String,
    pub role: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

pub struct ChannelRow {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub is_private: bool,
    pub created_by: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub workspace_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub parent_id: Option<String>,
    pub thread_root_id: Option<String>,
    pub created_at: String,
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that
/// lexicographic order in SQL equals chronological order.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

fn parse_opt_id(raw: Option<&str>) -> Result<Option<Uuid>> {
    raw.map(parse_id).transpose()
}

pub(crate) fn parse_role(raw: &str) -> Result<Role> {
    raw.parse().map_err(anyhow::Error::msg)
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: parse_id(&row.id)?,
            email: row.email,
            display_name: row.display_name,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

impl TryFrom<UserSummaryRow> for UserSummary {
    type Error = anyhow::Error;

    fn try_from(row: UserSummaryRow) -> Result<Self> {
        Ok(UserSummary {
            id: parse_id(&row.id)?,
            email: row.email,
            display_name: row.display_name,
        })
    }
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = anyhow::Error;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        Ok(Workspace {
            id: parse_id(&row.id)?,
            name: row.name,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

impl TryFrom<WorkspaceMemberRow> for WorkspaceMember {
    type Error = anyhow::Error;

    fn try_from(row: WorkspaceMemberRow) -> Result<Self> {
        Ok(WorkspaceMember {
            user_id: parse_id(&row.user_id)?,
            role: parse_role(&row.role)?,
            email: row.email,
            display_name: row.display_name,
        })
    }
}

impl TryFrom<ChannelRow> for Channel {
    type Error = anyhow::Error;

    fn try_from(row: ChannelRow) -> Result<Self> {
        Ok(Channel {
            id: parse_id(&row.id)?,
            workspace_id: parse_id(&row.workspace_id)?,
            name: row.name,
            is_private: row.is_private,
            created_by: parse_opt_id(row.created_by.as_deref())?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

impl ChannelRow {
    pub fn meta(&self) -> Result<ChannelMeta> {
        Ok(ChannelMeta {
            id: parse_id(&self.id)?,
            workspace_id: parse_id(&self.workspace_id)?,
            is_private: self.is_private,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: parse_id(&row.id)?,
            workspace_id: parse_id(&row.workspace_id)?,
            channel_id: parse_id(&row.channel_id)?,
            user_id: parse_id(&row.user_id)?,
            text: row.text,
            parent_id: parse_opt_id(row.parent_id.as_deref())?,
            thread_root_id: parse_opt_id(row.thread_root_id.as_deref())?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}
