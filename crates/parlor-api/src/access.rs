//! Channel access policy.
//!
//! Every decision here is a pure function of channel metadata and membership
//! facts that were fetched beforehand; nothing in this module touches storage
//! except [`resolve`], which gathers those facts.

use uuid::Uuid;

use parlor_db::MembershipStore;
use parlor_types::error::{Error, Result};
use parlor_types::models::{ChannelMeta, Role};

/// Membership facts about one user, relative to one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipFacts {
    pub workspace_member: bool,
    pub channel_role: Option<Role>,
}

/// The verdict for one user on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub can_read: bool,
    pub can_write: bool,
    pub role: Option<Role>,
}

impl Access {
    pub fn is_member(&self) -> bool {
        self.role.is_some()
    }

    pub fn require_read(&self) -> Result<()> {
        if self.can_read {
            Ok(())
        } else {
            Err(Error::forbidden("no read access to channel"))
        }
    }

    pub fn require_write(&self) -> Result<()> {
        if self.can_write {
            Ok(())
        } else {
            Err(Error::forbidden("only channel members can post"))
        }
    }
}

/// Read: public channels are open to workspace members, private channels
/// only to channel members. Write: channel members only, whatever the
/// visibility.
pub fn evaluate(channel: &ChannelMeta, facts: &MembershipFacts) -> Access {
    let channel_member = facts.channel_role.is_some();
    let can_read = if channel.is_private {
        channel_member
    } else {
        facts.workspace_member
    };

    Access {
        can_read,
        can_write: channel_member,
        role: facts.channel_role,
    }
}

pub fn require_workspace_member(is_member: bool) -> Result<()> {
    if is_member {
        Ok(())
    } else {
        Err(Error::forbidden("not a workspace member"))
    }
}

/// A user may add themselves only to a public channel of a workspace they
/// belong to. Private channels are populated by invitation.
pub fn check_self_join(channel: &ChannelMeta, facts: &MembershipFacts) -> Result<()> {
    require_workspace_member(facts.workspace_member)?;
    if channel.is_private {
        return Err(Error::forbidden("cannot self-join a private channel"));
    }
    Ok(())
}

/// Only channel members may bring others in.
pub fn require_inviter(inviter: &Access) -> Result<()> {
    if inviter.is_member() {
        Ok(())
    } else {
        Err(Error::forbidden("only channel members can add members"))
    }
}

/// The inviter must be a channel member and the invitee must already belong
/// to the channel's workspace.
pub fn check_invite(inviter: &Access, invitee_in_workspace: bool) -> Result<()> {
    require_inviter(inviter)?;
    if !invitee_in_workspace {
        return Err(Error::forbidden("invitee is not a workspace member"));
    }
    Ok(())
}

/// Fetches the channel and the caller's membership facts and evaluates them.
/// Blocking; call from a blocking context.
pub fn resolve<S>(store: &S, user_id: Uuid, channel_id: Uuid) -> Result<(ChannelMeta, MembershipFacts, Access)>
where
    S: MembershipStore + ?Sized,
{
    let channel = store
        .channel_meta(channel_id)?
        .ok_or_else(|| Error::not_found("channel"))?;

    let facts = MembershipFacts {
        workspace_member: store.is_workspace_member(user_id, channel.workspace_id)?,
        channel_role: store.channel_role(user_id, channel_id)?,
    };

    Ok((channel, facts, evaluate(&channel, &facts)))
}
