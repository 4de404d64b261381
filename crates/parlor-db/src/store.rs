//! Storage seams used by the messaging core. `Database` is the production
//! implementation; tests may substitute their own.

use anyhow::Result;
use uuid::Uuid;

use parlor_types::models::{ChannelMeta, Message, MessageFilter, NewMessage, Role};

use crate::Database;

/// Read-only membership facts needed for access decisions.
pub trait MembershipStore: Send + Sync {
    fn channel_meta(&self, channel_id: Uuid) -> Result<Option<ChannelMeta>>;

    fn is_workspace_member(&self, user_id: Uuid, workspace_id: Uuid) -> Result<bool>;

    fn channel_role(&self, user_id: Uuid, channel_id: Uuid) -> Result<Option<Role>>;

    fn is_channel_member(&self, user_id: Uuid, channel_id: Uuid) -> Result<bool> {
        Ok(self.channel_role(user_id, channel_id)?.is_some())
    }
}

/// Durable message log.
pub trait MessageStore: Send + Sync {
    /// Persists the message, assigning its id and creation time.
    fn insert_message(&self, new: &NewMessage) -> Result<Message>;

    fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    fn query_messages(&self, channel_id: Uuid, filter: &MessageFilter) -> Result<Vec<Message>>;
}

impl MembershipStore for Database {
    fn channel_meta(&self, channel_id: Uuid) -> Result<Option<ChannelMeta>> {
        self.get_channel_meta(channel_id)
    }

    fn is_workspace_member(&self, user_id: Uuid, workspace_id: Uuid) -> Result<bool> {
        Ok(self.workspace_role(user_id, workspace_id)?.is_some())
    }

    fn channel_role(&self, user_id: Uuid, channel_id: Uuid) -> Result<Option<Role>> {
        Database::channel_role(self, user_id, channel_id)
    }
}

impl MessageStore for Database {
    fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        Database::insert_message(self, new)
    }

    fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Database::get_message(self, id)
    }

    fn query_messages(&self, channel_id: Uuid, filter: &MessageFilter) -> Result<Vec<Message>> {
        Database::query_messages(self, channel_id, filter)
    }
}
