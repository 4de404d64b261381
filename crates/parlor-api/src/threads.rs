use uuid::Uuid;

use parlor_types::error::{Error, Result};
use parlor_types::models::Message;

/// Where a new message sits in its channel's thread structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    pub parent_id: Option<Uuid>,
    pub thread_root_id: Option<Uuid>,
}

/// Computes the placement of a message posted to `channel_id` with an
/// optional parent. `lookup` fetches the parent by id.
///
/// Replies to replies are flattened onto the top-level root, so every
/// message in a thread carries the same `thread_root_id`.
pub fn resolve<F>(channel_id: Uuid, parent_id: Option<Uuid>, lookup: F) -> Result<Placement>
where
    F: FnOnce(Uuid) -> anyhow::Result<Option<Message>>,
{
    let Some(parent_id) = parent_id else {
        return Ok(Placement::default());
    };

    let parent = lookup(parent_id)?.ok_or_else(|| Error::not_found("parent message"))?;
    if parent.channel_id != channel_id {
        return Err(Error::invalid("parent message belongs to a different channel"));
    }

    Ok(Placement {
        parent_id: Some(parent.id),
        thread_root_id: Some(parent.thread_root_id.unwrap_or(parent.id)),
    })
}
