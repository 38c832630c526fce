use crate::config::{FeedConfig, MessagingConfig};
use crate::domain::conversation::Conversation;
use crate::domain::identity::IdentityProvider;
use crate::domain::message::{Draft, Message, MessageCursor, MessageKind, Page};
use crate::error::{AppError, Result};
use crate::services::conversation_resolver::ConversationResolver;
use crate::services::conversation_store::ConversationStore;
use crate::services::event_ingestor::{ConversationHandle, EventIngestor};
use crate::services::feed::EventFeed;
use crate::services::message_cache::{MessageCache, WindowSnapshot};
use crate::services::messaging_service::MessagingService;
use crate::services::store::{MessageStore, ReadReceipt};
use crate::services::unread_tracker::UnreadTracker;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Messaging context of one signed-in user. Owns the conversation list, the live
/// subscriptions and every conversation cache opened through it.
#[derive(Debug)]
pub struct MessagingSession {
    user_id: Uuid,
    service: MessagingService,
    resolver: ConversationResolver,
    tracker: UnreadTracker,
    list: ConversationStore,
    ingestor: EventIngestor,
}

impl MessagingSession {
    /// Starts a session for the current user and loads their conversation list.
    ///
    /// # Errors
    /// Returns `AppError::AuthError` without a signed-in user, or the subscription/list error.
    #[tracing::instrument(err(level = "warn"), skip_all)]
    pub async fn sign_in(
        identity: &dyn IdentityProvider,
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn EventFeed>,
        config: MessagingConfig,
        feed_config: FeedConfig,
    ) -> Result<Self> {
        let user_id = identity.current_user().await.ok_or(AppError::AuthError)?;

        let service = MessagingService::new(Arc::clone(&store), config.clone());
        let resolver = ConversationResolver::new(Arc::clone(&store), config.clone());
        let tracker = UnreadTracker::new(store, config);
        let list = ConversationStore::spawn(user_id, service.clone());
        let ingestor =
            EventIngestor::start(user_id, feed, service.clone(), tracker.clone(), list.clone(), feed_config).await?;
        list.refresh().await?;

        tracing::info!(user.id = %user_id, "Messaging session started");
        Ok(Self { user_id, service, resolver, tracker, list, ingestor })
    }

    #[must_use]
    pub const fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// # Errors
    /// See [`ConversationResolver::get_or_create`].
    pub async fn get_or_create_conversation(
        &self,
        buyer_id: Uuid,
        seller_id: Uuid,
        listing_id: Option<Uuid>,
    ) -> Result<Conversation> {
        let conversation = self.resolver.get_or_create(self.user_id, buyer_id, seller_id, listing_id).await?;
        self.list.upsert(conversation.clone());
        Ok(conversation)
    }

    /// Re-lists the user's active conversations, most recent first.
    ///
    /// # Errors
    /// Returns the storage error after retries.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.list.refresh().await
    }

    /// Live view of the conversation list.
    #[must_use]
    pub fn conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.list.subscribe()
    }

    /// Opens a conversation for live viewing. The first page is not loaded until
    /// [`OpenConversation::load_initial`] is called.
    ///
    /// # Errors
    /// Returns `AppError::Forbidden`/`AppError::NotFound` for inaccessible conversations.
    pub async fn open(&self, conversation_id: Uuid) -> Result<OpenConversation> {
        self.service.conversation(self.user_id, conversation_id).await?;
        let handle = self.ingestor.observe(conversation_id).await?;
        Ok(OpenConversation { handle })
    }

    /// Sends through the conversation's cache when it is open, directly otherwise.
    ///
    /// # Errors
    /// Returns `AppError::Validation` for invalid content or the send error.
    pub async fn send_message(&self, conversation_id: Uuid, content: &str, kind: MessageKind) -> Result<Message> {
        if let Some(cache) = self.ingestor.cache(conversation_id) {
            return cache.send(content, kind).await;
        }

        let draft = Draft::new(content, kind, self.service.config().max_content_length)?;
        let sent = self.service.send_message(self.user_id, conversation_id, draft).await?;
        self.list.upsert(sent.conversation);
        Ok(sent.message)
    }

    /// One page in ascending order. `cursor` comes from a previous page's `next_cursor`.
    ///
    /// # Errors
    /// Returns `AppError::Forbidden`/`AppError::NotFound` for inaccessible conversations or the storage error.
    pub async fn load_messages(&self, conversation_id: Uuid, cursor: Option<MessageCursor>) -> Result<Page> {
        self.service.load_messages(self.user_id, conversation_id, cursor, None).await
    }

    /// # Errors
    /// See [`UnreadTracker::mark_read`].
    pub async fn mark_read(&self, conversation_id: Uuid) -> Result<ReadReceipt> {
        if let Some(cache) = self.ingestor.cache(conversation_id) {
            return cache.mark_read().await;
        }

        let receipt = self.tracker.mark_read(conversation_id, self.user_id).await?;
        self.list.apply_read(receipt.clone());
        Ok(receipt)
    }

    /// Ends the session, stopping every subscription and actor it started.
    pub fn sign_out(self) {
        self.ingestor.shutdown();
        tracing::info!(user.id = %self.user_id, "Messaging session ended");
    }
}

/// An open conversation. Dropping it releases the live subscription once no other
/// view holds the conversation open.
#[derive(Debug)]
pub struct OpenConversation {
    handle: ConversationHandle,
}

impl OpenConversation {
    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.handle.conversation_id()
    }

    #[must_use]
    pub const fn cache(&self) -> &MessageCache {
        self.handle.cache()
    }

    /// # Errors
    /// See [`MessageCache::load_initial`].
    pub async fn load_initial(&self, page_size: Option<u32>) -> Result<()> {
        self.cache().load_initial(page_size).await
    }

    /// # Errors
    /// See [`MessageCache::load_older`].
    pub async fn load_older(&self) -> Result<Vec<Message>> {
        self.cache().load_older().await
    }

    /// # Errors
    /// See [`MessageCache::send`].
    pub async fn send(&self, content: &str, kind: MessageKind) -> Result<Message> {
        self.cache().send(content, kind).await
    }

    /// # Errors
    /// See [`MessageCache::mark_read`].
    pub async fn mark_read(&self) -> Result<ReadReceipt> {
        self.cache().mark_read().await
    }

    #[must_use]
    pub fn window(&self) -> WindowSnapshot {
        self.cache().snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WindowSnapshot> {
        self.cache().subscribe()
    }

    /// Puts the conversation in view. It is marked read once the debounce delay passes.
    pub async fn focus(&self) {
        self.handle.focus();
        self.cache().schedule_mark_read().await;
    }

    pub fn blur(&self) {
        self.handle.blur();
    }
}
