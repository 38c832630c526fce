use crate::domain::message::{Message, Page};
use crate::services::store::ReadReceipt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub message_type: String,
    pub metadata: serde_json::Value,
    pub client_message_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub cursor: String,
}

impl From<&Message> for MessageDto {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_id: m.sender_id,
            content: m.content.clone(),
            message_type: m.kind.type_name().to_string(),
            metadata: m.kind.metadata(),
            client_message_id: m.client_message_id,
            read_at: m.read_at,
            edited_at: m.edited_at,
            deleted_at: m.deleted_at,
            created_at: m.created_at,
            cursor: m.cursor().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDto {
    pub messages: Vec<MessageDto>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl From<&Page> for PageDto {
    fn from(page: &Page) -> Self {
        Self {
            messages: page.messages.iter().map(MessageDto::from).collect(),
            has_more: page.has_more,
            next_cursor: page.next_cursor.map(|c| c.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptDto {
    pub conversation_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
    pub message_ids: Vec<Uuid>,
    pub unread_count: u32,
}

impl From<&ReadReceipt> for ReadReceiptDto {
    fn from(r: &ReadReceipt) -> Self {
        Self {
            conversation_id: r.conversation_id,
            read_at: r.read_at,
            message_ids: r.message_ids.clone(),
            unread_count: r.conversation.unread_for(r.reader_id),
        }
    }
}
