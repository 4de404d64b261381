use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events sent over the WebSocket gateway.
///
/// Internally tagged so a created message goes out as
/// `{"type": "message_created", "message": {...}}`, the shape existing
/// clients parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A new message was persisted in a channel
    MessageCreated { message: Message },

    /// The connection now receives events for the channel
    Subscribed { channel_id: Uuid },

    /// The connection no longer receives events for the channel
    Unsubscribed { channel_id: Uuid },

    /// A command from this connection was rejected
    Error { detail: String },
}

impl GatewayEvent {
    /// Serializes once so a broadcast can share the text across subscribers.
    pub fn to_payload(&self) -> serde_json::Result<Arc<str>> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Start receiving events for a channel; read access is required.
    Subscribe { channel_id: Uuid },

    /// Stop receiving events for a channel.
    Unsubscribe { channel_id: Uuid },
}
