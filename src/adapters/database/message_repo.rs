use crate::adapters::database::records::MessageRecord;
use crate::domain::message::{Message, MessageCursor};
use crate::error::{AppError, Result};
use crate::services::store::NewMessage;
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct MessageRepository {}

impl MessageRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Records a new message in the database.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` if the conversation does not exist.
    /// Returns `AppError::Database` if the insert fails.
    #[tracing::instrument(level = "debug", skip(self, conn, message), fields(conversation_id = %message.conversation_id))]
    pub(crate) async fn create(&self, conn: &mut PgConnection, message: NewMessage) -> Result<Message> {
        let result = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, message_type, metadata, client_message_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                      read_at, edited_at, deleted_at, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.kind.type_name())
        .bind(message.kind.metadata())
        .bind(message.client_message_id)
        .fetch_one(conn)
        .await;

        match result {
            Ok(record) => record.try_into(),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23503") => {
                // Foreign key violation: conversation_id does not exist
                Err(AppError::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn find_by_id(&self, conn: &mut PgConnection, id: Uuid) -> Result<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                   read_at, edited_at, deleted_at, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;

        record.map(Message::try_from).transpose()
    }

    /// Fetches up to `limit` non-deleted messages strictly before `before`, newest first.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn fetch_before(
        &self,
        conn: &mut PgConnection,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let records = match before {
            Some(cursor) => {
                sqlx::query_as::<_, MessageRecord>(
                    r#"
                    SELECT id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                           read_at, edited_at, deleted_at, created_at
                    FROM messages
                    WHERE conversation_id = $1
                      AND deleted_at IS NULL
                      AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(conversation_id)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(limit)
                .fetch_all(conn)
                .await?
            }
            None => {
                sqlx::query_as::<_, MessageRecord>(
                    r#"
                    SELECT id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                           read_at, edited_at, deleted_at, created_at
                    FROM messages
                    WHERE conversation_id = $1
                      AND deleted_at IS NULL
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(conn)
                .await?
            }
        };

        records.into_iter().map(Message::try_from).collect()
    }

    /// # Errors
    /// Returns `AppError::NotFound` if the message is missing or deleted, `AppError::Database` otherwise.
    #[tracing::instrument(level = "debug", skip(self, conn, content))]
    pub(crate) async fn update_content(&self, conn: &mut PgConnection, id: Uuid, content: &str) -> Result<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            UPDATE messages SET content = $2, edited_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                      read_at, edited_at, deleted_at, created_at
            "#,
        )
        .bind(id)
        .bind(content)
        .fetch_optional(conn)
        .await?;

        record.ok_or(AppError::NotFound)?.try_into()
    }

    /// # Errors
    /// Returns `AppError::NotFound` if the message is missing or already deleted, `AppError::Database` otherwise.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn soft_delete(&self, conn: &mut PgConnection, id: Uuid) -> Result<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            UPDATE messages SET deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                      read_at, edited_at, deleted_at, created_at
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;

        record.ok_or(AppError::NotFound)?.try_into()
    }

    /// Sets `read_at` on every unread message `reader_id` received in the conversation.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn mark_read(
        &self,
        conn: &mut PgConnection,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> Result<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            UPDATE messages SET read_at = NOW()
            WHERE conversation_id = $1
              AND sender_id <> $2
              AND read_at IS NULL
              AND deleted_at IS NULL
            RETURNING id, conversation_id, sender_id, content, message_type, metadata, client_message_id,
                      read_at, edited_at, deleted_at, created_at
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .fetch_all(conn)
        .await?;

        let mut messages = records.into_iter().map(Message::try_from).collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(Message::cursor);
        Ok(messages)
    }
}
