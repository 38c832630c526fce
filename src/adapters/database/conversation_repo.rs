use crate::adapters::database::records::ConversationRecord;
use crate::domain::conversation::{Conversation, ConversationKey, ConversationStatus};
use crate::error::{AppError, Result};
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct ConversationRepository {}

impl ConversationRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn find_by_key(&self, conn: &mut PgConnection, key: &ConversationKey) -> Result<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                   buyer_unread_count, seller_unread_count, status, created_at, updated_at
            FROM conversations
            WHERE buyer_id = $1 AND seller_id = $2 AND listing_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.buyer_id)
        .bind(key.seller_id)
        .bind(key.listing_id)
        .fetch_optional(conn)
        .await?;

        record.map(Conversation::try_from).transpose()
    }

    /// Inserts a new conversation.
    ///
    /// # Errors
    /// Returns `AppError::Conflict` if one already exists for the key.
    /// Returns `AppError::Database` if the insert fails otherwise.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn insert(&self, conn: &mut PgConnection, key: &ConversationKey) -> Result<Conversation> {
        let result = sqlx::query_as::<_, ConversationRecord>(
            r#"
            INSERT INTO conversations (id, buyer_id, seller_id, listing_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                      buyer_unread_count, seller_unread_count, status, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(key.buyer_id)
        .bind(key.seller_id)
        .bind(key.listing_id)
        .fetch_one(conn)
        .await;

        match result {
            Ok(record) => record.try_into(),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => {
                // Unique violation: a concurrent insert for the same key won
                Err(AppError::Conflict("Conversation already exists".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn find_by_id(&self, conn: &mut PgConnection, id: Uuid) -> Result<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                   buyer_unread_count, seller_unread_count, status, created_at, updated_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;

        record.map(Conversation::try_from).transpose()
    }

    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn list_active_for_user(&self, conn: &mut PgConnection, user_id: Uuid) -> Result<Vec<Conversation>> {
        let records = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                   buyer_unread_count, seller_unread_count, status, created_at, updated_at
            FROM conversations
            WHERE (buyer_id = $1 OR seller_id = $1) AND status = 'active'
            ORDER BY last_message_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(conn)
        .await?;

        records.into_iter().map(Conversation::try_from).collect()
    }

    /// # Errors
    /// Returns `AppError::NotFound` for an unknown conversation or `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn set_status(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        status: ConversationStatus,
    ) -> Result<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            UPDATE conversations SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                      buyer_unread_count, seller_unread_count, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(conn)
        .await?;

        record.ok_or(AppError::NotFound)?.try_into()
    }

    /// Points the conversation at a newly stored message and bumps the recipient's counter.
    /// An archived conversation becomes active again.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` for an unknown conversation or `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn record_message(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        created_at: time::OffsetDateTime,
    ) -> Result<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            UPDATE conversations SET
                last_message_id = CASE WHEN $4 >= last_message_at THEN $2 ELSE last_message_id END,
                last_message_at = GREATEST(last_message_at, $4),
                buyer_unread_count = buyer_unread_count + CASE WHEN seller_id = $3 THEN 1 ELSE 0 END,
                seller_unread_count = seller_unread_count + CASE WHEN buyer_id = $3 THEN 1 ELSE 0 END,
                status = CASE WHEN status = 'archived' THEN 'active' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                      buyer_unread_count, seller_unread_count, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(message_id)
        .bind(sender_id)
        .bind(created_at)
        .fetch_optional(conn)
        .await?;

        record.ok_or(AppError::NotFound)?.try_into()
    }

    /// Re-derives `last_message_*` after a soft delete and, if the deleted message was
    /// still unread, decrements its recipient's counter.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` for an unknown conversation or `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn record_deletion(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
        sender_id: Uuid,
        was_unread: bool,
    ) -> Result<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            UPDATE conversations c SET
                last_message_id = latest.id,
                last_message_at = COALESCE(latest.created_at, c.created_at),
                buyer_unread_count = GREATEST(c.buyer_unread_count - CASE WHEN $3 AND c.seller_id = $2 THEN 1 ELSE 0 END, 0),
                seller_unread_count = GREATEST(c.seller_unread_count - CASE WHEN $3 AND c.buyer_id = $2 THEN 1 ELSE 0 END, 0),
                updated_at = NOW()
            FROM conversations base
            LEFT JOIN LATERAL (
                SELECT m.id, m.created_at FROM messages m
                WHERE m.conversation_id = base.id AND m.deleted_at IS NULL
                ORDER BY m.created_at DESC, m.id DESC
                LIMIT 1
            ) latest ON TRUE
            WHERE c.id = $1 AND base.id = c.id
            RETURNING c.id, c.buyer_id, c.seller_id, c.listing_id, c.last_message_id, c.last_message_at,
                      c.buyer_unread_count, c.seller_unread_count, c.status, c.created_at, c.updated_at
            "#,
        )
        .bind(id)
        .bind(sender_id)
        .bind(was_unread)
        .fetch_optional(conn)
        .await?;

        record.ok_or(AppError::NotFound)?.try_into()
    }

    /// Zeroes `reader_id`'s counter.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` for an unknown conversation or `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn reset_unread(&self, conn: &mut PgConnection, id: Uuid, reader_id: Uuid) -> Result<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            UPDATE conversations SET
                buyer_unread_count = CASE WHEN buyer_id = $2 THEN 0 ELSE buyer_unread_count END,
                seller_unread_count = CASE WHEN seller_id = $2 THEN 0 ELSE seller_unread_count END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, buyer_id, seller_id, listing_id, last_message_id, last_message_at,
                      buyer_unread_count, seller_unread_count, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(reader_id)
        .fetch_optional(conn)
        .await?;

        record.ok_or(AppError::NotFound)?.try_into()
    }

    /// Recomputes both counters from the messages table and returns the ids of the
    /// conversations whose stored values were wrong.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn recount_unread(&self, conn: &mut PgConnection, id: Option<Uuid>) -> Result<Vec<Uuid>> {
        let corrected: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            WITH counts AS (
                SELECT c.id,
                       COUNT(m.id) FILTER (WHERE m.sender_id = c.seller_id)::int AS buyer_unread,
                       COUNT(m.id) FILTER (WHERE m.sender_id = c.buyer_id)::int AS seller_unread
                FROM conversations c
                LEFT JOIN messages m
                    ON m.conversation_id = c.id AND m.read_at IS NULL AND m.deleted_at IS NULL
                WHERE $1::uuid IS NULL OR c.id = $1
                GROUP BY c.id
            )
            UPDATE conversations c SET
                buyer_unread_count = counts.buyer_unread,
                seller_unread_count = counts.seller_unread,
                updated_at = NOW()
            FROM counts
            WHERE c.id = counts.id
              AND (c.buyer_unread_count <> counts.buyer_unread OR c.seller_unread_count <> counts.seller_unread)
            RETURNING c.id
            "#,
        )
        .bind(id)
        .fetch_all(conn)
        .await?;

        Ok(corrected.into_iter().map(|(id,)| id).collect())
    }
}
