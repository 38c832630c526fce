use crate::domain::message::{Message, MessageKind};
use crate::error::AppError;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct MessageRecord {
    pub(crate) id: Uuid,
    pub(crate) conversation_id: Uuid,
    pub(crate) sender_id: Uuid,
    pub(crate) content: String,
    pub(crate) message_type: String,
    pub(crate) metadata: serde_json::Value,
    pub(crate) client_message_id: Option<Uuid>,
    pub(crate) read_at: Option<OffsetDateTime>,
    pub(crate) edited_at: Option<OffsetDateTime>,
    pub(crate) deleted_at: Option<OffsetDateTime>,
    pub(crate) created_at: OffsetDateTime,
}

impl TryFrom<MessageRecord> for Message {
    type Error = AppError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let kind = MessageKind::from_parts(&record.message_type, Some(record.metadata)).map_err(|e| {
            tracing::error!(message.id = %record.id, error = %e, "Stored message has invalid metadata");
            AppError::Internal
        })?;

        Ok(Self {
            id: record.id,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            kind,
            client_message_id: record.client_message_id,
            read_at: record.read_at,
            edited_at: record.edited_at,
            deleted_at: record.deleted_at,
            created_at: record.created_at,
        })
    }
}
