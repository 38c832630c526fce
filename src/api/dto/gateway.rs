use crate::api::dto::message::MessageDto;
use crate::domain::conversation::ConversationUpdate;
use crate::domain::event::FeedEvent;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Frames a gateway client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Observe { conversation_id: Uuid },
    Unobserve { conversation_id: Uuid },
}

/// Frames pushed to a gateway client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Observing { conversation_id: Uuid },
    Unobserved { conversation_id: Uuid },
    MessageCreated { message: MessageDto },
    MessageUpdated { message: MessageDto },
    ConversationUpdated { conversation: ConversationChangeDto },
    /// Events may have been missed; the client should reload what it shows.
    Resync { conversation_id: Option<Uuid> },
    Error { message: String },
}

impl ServerFrame {
    #[must_use]
    pub fn from_event(event: &FeedEvent, user_id: Uuid) -> Self {
        match event {
            FeedEvent::MessageCreated(m) => Self::MessageCreated { message: m.into() },
            FeedEvent::MessageUpdated(m) => Self::MessageUpdated { message: m.into() },
            FeedEvent::ConversationUpdated(u) => {
                Self::ConversationUpdated { conversation: ConversationChangeDto::for_user(u, user_id) }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationChangeDto {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub last_message_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    pub unread_count: Option<u32>,
    pub status: Option<String>,
}

impl ConversationChangeDto {
    #[must_use]
    pub fn for_user(update: &ConversationUpdate, user_id: Uuid) -> Self {
        let unread_count = if user_id == update.buyer_id {
            update.buyer_unread_count
        } else if user_id == update.seller_id {
            update.seller_unread_count
        } else {
            None
        };
        Self {
            id: update.id,
            updated_at: update.updated_at,
            last_message_id: update.last_message_id,
            last_message_at: update.last_message_at,
            unread_count,
            status: update.status.map(|s| s.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_format() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"observe","conversationId":"{id}"}}"#);
        let frame: ClientFrame = serde_json::from_str(&raw).expect("frame parses");
        assert!(matches!(frame, ClientFrame::Observe { conversation_id } if conversation_id == id));

        let resync = serde_json::to_value(ServerFrame::Resync { conversation_id: None }).expect("serializes");
        assert_eq!(resync["type"], "resync");
        assert!(resync["conversationId"].is_null());
    }
}
