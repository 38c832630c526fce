use crate::adapters::database::DbPool;
use crate::adapters::database::conversation_repo::ConversationRepository;
use crate::adapters::database::feed::{ChangeNotice, FEED_CHANNEL};
use crate::adapters::database::message_repo::MessageRepository;
use crate::domain::conversation::{Conversation, ConversationKey, ConversationStatus};
use crate::domain::message::{Message, MessageCursor};
use crate::error::{AppError, Result};
use crate::services::store::{MessageStore, NewMessage, ReadReceipt, SentMessage};
use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

/// Postgres-backed [`MessageStore`]. Every mutation queues its change notices on
/// [`FEED_CHANNEL`] inside the same transaction, so they are only delivered on commit.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: DbPool,
    conversations: ConversationRepository,
    messages: MessageRepository,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool, conversations: ConversationRepository::new(), messages: MessageRepository::new() }
    }

    async fn notify(conn: &mut PgConnection, notices: &[ChangeNotice]) -> Result<()> {
        for notice in notices {
            let payload = serde_json::to_string(notice).map_err(|_| AppError::Internal)?;
            sqlx::query("SELECT pg_notify($1, $2)").bind(FEED_CHANNEL).bind(payload).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let mut conn = self.pool.acquire().await?;
        self.conversations.find_by_key(&mut conn, key).await
    }

    async fn insert_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let mut tx = self.pool.begin().await?;
        let conversation = self.conversations.insert(&mut tx, key).await?;
        Self::notify(&mut tx, &[ChangeNotice::ConversationUpdated { conversation_id: conversation.id }]).await?;
        tx.commit().await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let mut conn = self.pool.acquire().await?;
        self.conversations.find_by_id(&mut conn, id).await
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let mut conn = self.pool.acquire().await?;
        self.conversations.list_active_for_user(&mut conn, user_id).await
    }

    async fn set_conversation_status(&self, id: Uuid, status: ConversationStatus) -> Result<Conversation> {
        let mut tx = self.pool.begin().await?;
        let conversation = self.conversations.set_status(&mut tx, id, status).await?;
        Self::notify(&mut tx, &[ChangeNotice::ConversationUpdated { conversation_id: id }]).await?;
        tx.commit().await?;
        Ok(conversation)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<SentMessage> {
        let mut tx = self.pool.begin().await?;
        let message = self.messages.create(&mut tx, message).await?;
        let conversation = self
            .conversations
            .record_message(&mut tx, message.conversation_id, message.id, message.sender_id, message.created_at)
            .await?;
        Self::notify(
            &mut tx,
            &[
                ChangeNotice::MessageCreated { message_id: message.id },
                ChangeNotice::ConversationUpdated { conversation_id: conversation.id },
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(SentMessage { message, conversation })
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let mut conn = self.pool.acquire().await?;
        self.messages.find_by_id(&mut conn, id).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        self.messages.fetch_before(&mut conn, conversation_id, before, i64::from(limit)).await
    }

    async fn edit_message(&self, id: Uuid, content: &str) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let message = self.messages.update_content(&mut tx, id, content).await?;
        Self::notify(&mut tx, &[ChangeNotice::MessageUpdated { message_id: id }]).await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn soft_delete_message(&self, id: Uuid) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let message = self.messages.soft_delete(&mut tx, id).await?;
        let conversation = self
            .conversations
            .record_deletion(&mut tx, message.conversation_id, message.sender_id, message.read_at.is_none())
            .await?;
        Self::notify(
            &mut tx,
            &[
                ChangeNotice::MessageUpdated { message_id: id },
                ChangeNotice::ConversationUpdated { conversation_id: conversation.id },
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        let mut tx = self.pool.begin().await?;
        let marked = self.messages.mark_read(&mut tx, conversation_id, reader_id).await?;
        let conversation = self.conversations.reset_unread(&mut tx, conversation_id, reader_id).await?;
        if !conversation.is_participant(reader_id) {
            tx.rollback().await?;
            return Err(AppError::Forbidden);
        }

        let mut notices: Vec<ChangeNotice> =
            marked.iter().map(|m| ChangeNotice::MessageUpdated { message_id: m.id }).collect();
        notices.push(ChangeNotice::ConversationUpdated { conversation_id });
        Self::notify(&mut tx, &notices).await?;
        tx.commit().await?;

        Ok(ReadReceipt {
            conversation_id,
            reader_id,
            // NOW() is fixed for the transaction, so this equals every marked read_at
            read_at: conversation.updated_at,
            message_ids: marked.into_iter().map(|m| m.id).collect(),
            conversation,
        })
    }

    async fn recount_unread(&self, conversation_id: Option<Uuid>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let corrected = self.conversations.recount_unread(&mut tx, conversation_id).await?;
        let notices: Vec<ChangeNotice> =
            corrected.iter().map(|id| ChangeNotice::ConversationUpdated { conversation_id: *id }).collect();
        Self::notify(&mut tx, &notices).await?;
        tx.commit().await?;
        Ok(corrected.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
