use crate::domain::conversation::Conversation;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A conversation as seen by one participant: `unreadCount` is the caller's own counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDto {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub listing_id: Option<Uuid>,
    pub last_message_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
    pub unread_count: u32,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ConversationDto {
    #[must_use]
    pub fn for_user(conversation: &Conversation, user_id: Uuid) -> Self {
        Self {
            id: conversation.id,
            buyer_id: conversation.buyer_id,
            seller_id: conversation.seller_id,
            listing_id: conversation.listing_id,
            last_message_id: conversation.last_message_id,
            last_message_at: conversation.last_message_at,
            unread_count: conversation.unread_for(user_id),
            status: conversation.status.as_str().to_string(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    #[serde(default)]
    pub listing_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConversationRequest {
    pub status: String,
}
