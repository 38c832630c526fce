use crate::domain::conversation::{Conversation, ConversationKey, ConversationStatus};
use crate::domain::message::{Message, MessageCursor, MessageKind};
use crate::error::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub client_message_id: Option<Uuid>,
}

/// A stored message together with the conversation row it updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message: Message,
    pub conversation: Conversation,
}

/// Outcome of one atomic mark-read operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub reader_id: Uuid,
    pub read_at: OffsetDateTime,
    /// Messages whose `read_at` this operation set.
    pub message_ids: Vec<Uuid>,
    /// Conversation row after the operation.
    pub conversation: Conversation,
}

/// Durable storage for conversations and messages.
///
/// Implementations must enforce one conversation per [`ConversationKey`], keep
/// `last_message_*` and both unread counters consistent with the messages they
/// hold, and apply `insert_message`, `soft_delete_message` and `mark_read` atomically.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    async fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>>;

    /// Returns `AppError::Conflict` if a conversation with this key already exists.
    async fn insert_conversation(&self, key: &ConversationKey) -> Result<Conversation>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    /// Active conversations of `user_id`, most recent activity first.
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>>;

    async fn set_conversation_status(&self, id: Uuid, status: ConversationStatus) -> Result<Conversation>;

    /// Stores the message, bumps `last_message_*` and the recipient's unread counter.
    async fn insert_message(&self, message: NewMessage) -> Result<SentMessage>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Up to `limit` non-deleted messages strictly before `before`, newest first.
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>>;

    async fn edit_message(&self, id: Uuid, content: &str) -> Result<Message>;

    async fn soft_delete_message(&self, id: Uuid) -> Result<Message>;

    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt>;

    /// Recomputes unread counters from messages; returns how many conversations were corrected.
    async fn recount_unread(&self, conversation_id: Option<Uuid>) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}
