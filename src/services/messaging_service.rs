use crate::config::MessagingConfig;
use crate::domain::conversation::{Conversation, ConversationStatus};
use crate::domain::message::{Draft, Message, MessageCursor, Page};
use crate::error::{AppError, Result};
use crate::services::store::{MessageStore, NewMessage, SentMessage};
use crate::services::{retrying, with_timeout};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub(crate) sent_total: Counter<u64>,
    pub(crate) page_size: Histogram<u64>,
    pub(crate) mutations_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            sent_total: meter
                .u64_counter("marketdz_messages_sent_total")
                .with_description("Total messages successfully sent")
                .build(),
            page_size: meter
                .u64_histogram("marketdz_message_page_size")
                .with_description("Number of messages returned in a single page")
                .build(),
            mutations_total: meter
                .u64_counter("marketdz_message_mutations_total")
                .with_description("Message edits and soft deletes")
                .build(),
        }
    }
}

/// Authorization-checked operations over the message store.
#[derive(Clone, Debug)]
pub struct MessagingService {
    store: Arc<dyn MessageStore>,
    config: MessagingConfig,
    metrics: Metrics,
}

impl MessagingService {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: MessagingConfig) -> Self {
        Self { store, config, metrics: Metrics::new() }
    }

    #[must_use]
    pub const fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Loads a conversation the caller participates in.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` if it does not exist, `AppError::Forbidden` if the caller is not a party.
    #[tracing::instrument(level = "debug", err(level = "debug"), skip(self))]
    pub async fn conversation(&self, caller: Uuid, conversation_id: Uuid) -> Result<Conversation> {
        let conversation = retrying(&self.config, "get_conversation", || self.store.get_conversation(conversation_id))
            .await?
            .ok_or(AppError::NotFound)?;
        if !conversation.is_participant(caller) {
            return Err(AppError::Forbidden);
        }
        Ok(conversation)
    }

    /// # Errors
    /// Returns the storage error after retries.
    #[tracing::instrument(level = "debug", err(level = "warn"), skip(self))]
    pub async fn list_conversations(&self, caller: Uuid) -> Result<Vec<Conversation>> {
        retrying(&self.config, "list_conversations", || self.store.list_conversations(caller)).await
    }

    /// Stores a message. Not retried: a timed-out insert may still have landed, and the
    /// caller's `client_message_id` lets the live echo reconcile it.
    ///
    /// # Errors
    /// Returns `AppError::Validation` if the conversation is blocked, `AppError::Forbidden`
    /// if the caller is not a party, or `AppError::TransientNetwork` on timeout.
    #[tracing::instrument(
        err(level = "warn"),
        skip(self, draft),
        fields(conversation_id = %conversation_id, message_type = draft.kind.type_name())
    )]
    pub async fn send_message(&self, caller: Uuid, conversation_id: Uuid, draft: Draft) -> Result<SentMessage> {
        let conversation = self.conversation(caller, conversation_id).await?;
        if conversation.status == ConversationStatus::Blocked {
            return Err(AppError::validation("Conversation is blocked"));
        }

        let new = NewMessage {
            conversation_id,
            sender_id: caller,
            content: draft.content,
            kind: draft.kind,
            client_message_id: draft.client_message_id,
        };
        let sent = with_timeout(self.config.request_timeout(), "insert_message", self.store.insert_message(new)).await?;

        self.metrics.sent_total.add(1, &[KeyValue::new("message_type", sent.message.kind.type_name())]);
        tracing::debug!(message_id = %sent.message.id, "Message stored");
        Ok(sent)
    }

    /// One page of messages in ascending order, strictly older than `before` when given.
    ///
    /// # Errors
    /// Returns `AppError::Forbidden`/`AppError::NotFound` for inaccessible conversations or the storage error.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(conversation_id = %conversation_id))]
    pub async fn load_messages(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: Option<u32>,
    ) -> Result<Page> {
        self.conversation(caller, conversation_id).await?;
        let limit = limit.unwrap_or(self.config.page_size).clamp(1, self.config.max_page_size);
        let fetched = self.fetch_before(conversation_id, before, limit).await?;
        Ok(Page::from_descending(fetched, limit))
    }

    /// Newest-first fetch without authorization, for callers that checked access already.
    pub(crate) async fn fetch_before(
        &self,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let fetched =
            retrying(&self.config, "fetch_messages", || self.store.fetch_messages(conversation_id, before, limit))
                .await?;
        self.metrics.page_size.record(fetched.len() as u64, &[]);
        Ok(fetched)
    }

    /// Replaces the content of one of the caller's messages.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` for unknown or deleted messages, `AppError::Forbidden`
    /// if the caller did not send it, `AppError::Validation` for invalid content.
    #[tracing::instrument(err(level = "warn"), skip(self, content), fields(message_id = %message_id))]
    pub async fn edit_message(&self, caller: Uuid, message_id: Uuid, content: &str) -> Result<Message> {
        let message = self.own_message(caller, message_id).await?;
        let draft = Draft::new(content, message.kind, self.config.max_content_length)?;

        let edited =
            with_timeout(self.config.request_timeout(), "edit_message", self.store.edit_message(message_id, &draft.content))
                .await?;
        self.metrics.mutations_total.add(1, &[KeyValue::new("kind", "edit")]);
        Ok(edited)
    }

    /// Soft-deletes one of the caller's messages.
    ///
    /// # Errors
    /// Same as [`Self::edit_message`].
    #[tracing::instrument(err(level = "warn"), skip(self), fields(message_id = %message_id))]
    pub async fn delete_message(&self, caller: Uuid, message_id: Uuid) -> Result<Message> {
        self.own_message(caller, message_id).await?;
        let deleted =
            with_timeout(self.config.request_timeout(), "soft_delete_message", self.store.soft_delete_message(message_id))
                .await?;
        self.metrics.mutations_total.add(1, &[KeyValue::new("kind", "delete")]);
        Ok(deleted)
    }

    /// # Errors
    /// Returns `AppError::Forbidden`/`AppError::NotFound` for inaccessible conversations or the storage error.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(conversation_id = %conversation_id, status = %status))]
    pub async fn set_status(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> Result<Conversation> {
        self.conversation(caller, conversation_id).await?;
        with_timeout(
            self.config.request_timeout(),
            "set_conversation_status",
            self.store.set_conversation_status(conversation_id, status),
        )
        .await
    }

    async fn own_message(&self, caller: Uuid, message_id: Uuid) -> Result<Message> {
        let message = retrying(&self.config, "get_message", || self.store.get_message(message_id))
            .await?
            .filter(|m| !m.is_deleted())
            .ok_or(AppError::NotFound)?;
        if message.sender_id != caller {
            return Err(AppError::Forbidden);
        }
        Ok(message)
    }
}
