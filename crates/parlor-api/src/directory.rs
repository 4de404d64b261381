//! Workspace and channel membership plumbing around the access policy.

use std::sync::Arc;

use uuid::Uuid;

use parlor_db::Database;
use parlor_types::error::{Error, Result};
use parlor_types::models::{
    Channel, ChannelMeta, Role, User, UserSearch, UserSummary, Workspace, WorkspaceMember,
};

use crate::access::{self, Access};
use crate::service::blocking;

pub struct Directory {
    db: Arc<Database>,
}

/// Non-empty after trimming, or `InvalidArgument`.
fn normalize_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::invalid("name must not be empty"));
    }
    Ok(name.to_string())
}

fn user_search(query: &str, limit: Option<u32>) -> Result<UserSearch> {
    UserSearch::new(query, limit).ok_or_else(|| Error::invalid("q must not be empty"))
}

/// Workspace must exist and `user_id` must belong to it.
fn require_workspace(db: &Database, user_id: Uuid, workspace_id: Uuid) -> Result<()> {
    if !db.workspace_exists(workspace_id)? {
        return Err(Error::not_found("workspace"));
    }
    access::require_workspace_member(db.workspace_role(user_id, workspace_id)?.is_some())
}

impl Directory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // -- Users --

    pub async fn current_user(&self, user_id: Uuid) -> Result<User> {
        blocking(&self.db, move |db| db.get_user(user_id)?.ok_or_else(|| Error::not_found("user"))).await
    }

    pub async fn search_users(&self, query: &str, limit: Option<u32>) -> Result<Vec<UserSummary>> {
        let search = user_search(query, limit)?;
        blocking(&self.db, move |db| Ok(db.search_users(&search)?)).await
    }

    /// Workspace members the caller could invite to `channel_id`.
    pub async fn search_invitees(
        &self,
        inviter: Uuid,
        channel_id: Uuid,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<UserSummary>> {
        let search = user_search(query, limit)?;
        blocking(&self.db, move |db| {
            let (channel, _, inviter_access) = access::resolve(db, inviter, channel_id)?;
            access::require_inviter(&inviter_access)?;
            Ok(db.search_channel_candidates(&channel, &search)?)
        })
        .await
    }

    // -- Workspaces --

    pub async fn create_workspace(&self, user_id: Uuid, name: &str) -> Result<Workspace> {
        let name = normalize_name(name)?;
        blocking(&self.db, move |db| Ok(db.create_workspace(user_id, &name)?)).await
    }

    pub async fn list_workspaces(&self, user_id: Uuid) -> Result<Vec<Workspace>> {
        blocking(&self.db, move |db| Ok(db.list_workspaces_for_user(user_id)?)).await
    }

    /// Idempotent: re-adding an existing member keeps their current role.
    pub async fn add_workspace_member(
        &self,
        inviter: Uuid,
        workspace_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<()> {
        blocking(&self.db, move |db| {
            require_workspace(db, inviter, workspace_id)?;
            if db.get_user(user_id)?.is_none() {
                return Err(Error::not_found("user"));
            }
            db.add_workspace_member(user_id, workspace_id, role)?;
            Ok(())
        })
        .await
    }

    pub async fn list_workspace_members(&self, user_id: Uuid, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        blocking(&self.db, move |db| {
            require_workspace(db, user_id, workspace_id)?;
            Ok(db.list_workspace_members(workspace_id)?)
        })
        .await
    }

    // -- Channels --

    /// Creates a channel with the caller as owner.
    pub async fn create_channel(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        name: &str,
        is_private: bool,
    ) -> Result<Channel> {
        let name = normalize_name(name)?;
        blocking(&self.db, move |db| {
            require_workspace(db, user_id, workspace_id)?;
            db.create_channel(workspace_id, &name, is_private, user_id)?
                .ok_or_else(|| Error::Conflict(format!("channel '{}' already exists in workspace", name)))
        })
        .await
    }

    /// Public channels plus the private ones the caller belongs to.
    pub async fn list_channels(&self, user_id: Uuid, workspace_id: Uuid) -> Result<Vec<Channel>> {
        blocking(&self.db, move |db| {
            require_workspace(db, user_id, workspace_id)?;
            Ok(db.list_visible_channels(workspace_id, user_id)?)
        })
        .await
    }

    /// Self-join. The channel must live in `workspace_id`.
    pub async fn join_channel(&self, user_id: Uuid, workspace_id: Uuid, channel_id: Uuid) -> Result<()> {
        blocking(&self.db, move |db| {
            let (channel, facts, _) = access::resolve(db, user_id, channel_id)?;
            if channel.workspace_id != workspace_id {
                return Err(Error::forbidden("channel belongs to a different workspace"));
            }
            access::check_self_join(&channel, &facts)?;
            db.add_channel_member(user_id, channel_id, Role::Member)?;
            Ok(())
        })
        .await
    }

    /// Invitation by an existing channel member.
    pub async fn add_channel_member(
        &self,
        inviter: Uuid,
        channel_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<()> {
        blocking(&self.db, move |db| {
            let (channel, _, inviter_access) = access::resolve(db, inviter, channel_id)?;
            let invitee_in_workspace = db.workspace_role(user_id, channel.workspace_id)?.is_some();
            access::check_invite(&inviter_access, invitee_in_workspace)?;
            db.add_channel_member(user_id, channel_id, role)?;
            Ok(())
        })
        .await
    }

    /// The caller's standing in a channel. Requires read access.
    pub async fn channel_access(&self, user_id: Uuid, channel_id: Uuid) -> Result<(ChannelMeta, Access)> {
        blocking(&self.db, move |db| {
            let (channel, _, access) = access::resolve(db, user_id, channel_id)?;
            access.require_read()?;
            Ok((channel, access))
        })
        .await
    }
}
