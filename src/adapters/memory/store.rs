use super::InMemoryFeed;
use crate::domain::conversation::{Conversation, ConversationKey, ConversationStatus, ConversationUpdate};
use crate::domain::event::FeedEvent;
use crate::domain::message::{Message, MessageCursor};
use crate::error::{AppError, Result};
use crate::services::store::{MessageStore, NewMessage, ReadReceipt, SentMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Message>,
    clock: Option<OffsetDateTime>,
}

impl State {
    /// Strictly increasing timestamps so that insertion order matches the cursor order.
    fn tick(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let ts = match self.clock {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(ts);
        ts
    }

    fn conversation_mut(&mut self, id: Uuid) -> Result<&mut Conversation> {
        self.conversations.get_mut(&id).ok_or(AppError::NotFound)
    }

    fn unread_count(&self, conversation: &Conversation, user_id: Uuid) -> u32 {
        let count = self
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation.id && m.is_unread_for(user_id))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn latest_message(&self, conversation_id: Uuid) -> Option<&Message> {
        self.messages
            .values()
            .filter(|m| m.conversation_id == conversation_id && !m.is_deleted())
            .max_by_key(|m| m.cursor())
    }
}

/// `MessageStore` kept in process memory. When a feed is attached, every mutation
/// is published to it after the state lock is released.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    feed: Option<Arc<InMemoryFeed>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_feed(feed: Arc<InMemoryFeed>) -> Self {
        Self { state: Mutex::default(), feed: Some(feed) }
    }

    /// Overwrites a stored unread counter without touching messages.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` for an unknown conversation.
    pub async fn force_unread(&self, conversation_id: Uuid, user_id: Uuid, count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.conversation_mut(conversation_id)?.set_unread_for(user_id, count);
        Ok(())
    }

    fn publish(&self, events: &[FeedEvent]) {
        if let Some(feed) = &self.feed {
            for event in events {
                feed.publish(event);
            }
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let state = self.state.lock().await;
        Ok(state.conversations.values().find(|c| c.key() == *key).cloned())
    }

    async fn insert_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let conversation = {
            let mut state = self.state.lock().await;
            if state.conversations.values().any(|c| c.key() == *key) {
                return Err(AppError::Conflict("Conversation already exists".into()));
            }
            let now = state.tick();
            let conversation = Conversation {
                id: Uuid::now_v7(),
                buyer_id: key.buyer_id,
                seller_id: key.seller_id,
                listing_id: key.listing_id,
                last_message_id: None,
                last_message_at: now,
                buyer_unread_count: 0,
                seller_unread_count: 0,
                status: ConversationStatus::Active,
                created_at: now,
                updated_at: now,
            };
            state.conversations.insert(conversation.id, conversation.clone());
            conversation
        };

        self.publish(&[FeedEvent::ConversationUpdated(ConversationUpdate::from(&conversation))]);
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.state.lock().await.conversations.get(&id).cloned())
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut list: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.is_participant(user_id) && c.status == ConversationStatus::Active)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at).then(b.id.cmp(&a.id)));
        Ok(list)
    }

    async fn set_conversation_status(&self, id: Uuid, status: ConversationStatus) -> Result<Conversation> {
        let conversation = {
            let mut state = self.state.lock().await;
            let now = state.tick();
            let conversation = state.conversation_mut(id)?;
            conversation.status = status;
            conversation.updated_at = now;
            conversation.clone()
        };

        self.publish(&[FeedEvent::ConversationUpdated(ConversationUpdate::from(&conversation))]);
        Ok(conversation)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<SentMessage> {
        let sent = {
            let mut state = self.state.lock().await;
            let now = state.tick();
            let conversation = state.conversation_mut(new.conversation_id)?;
            let recipient = conversation.counterpart(new.sender_id).ok_or(AppError::Forbidden)?;

            let message = Message {
                id: Uuid::now_v7(),
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                content: new.content,
                kind: new.kind,
                client_message_id: new.client_message_id,
                read_at: None,
                edited_at: None,
                deleted_at: None,
                created_at: now,
            };

            let unread = conversation.unread_for(recipient).saturating_add(1);
            conversation.set_unread_for(recipient, unread);
            conversation.record_last_message(message.id, now);
            conversation.updated_at = now;
            if conversation.status == ConversationStatus::Archived {
                conversation.status = ConversationStatus::Active;
            }
            let conversation = conversation.clone();

            state.messages.insert(message.id, message.clone());
            SentMessage { message, conversation }
        };

        self.publish(&[
            FeedEvent::MessageCreated(sent.message.clone()),
            FeedEvent::ConversationUpdated(ConversationUpdate::from(&sent.conversation)),
        ]);
        Ok(sent)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut page: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id && !m.is_deleted())
            .filter(|m| before.is_none_or(|cursor| m.cursor() < cursor))
            .cloned()
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse(m.cursor()));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn edit_message(&self, id: Uuid, content: &str) -> Result<Message> {
        let message = {
            let mut state = self.state.lock().await;
            let now = state.tick();
            let message = state.messages.get_mut(&id).filter(|m| !m.is_deleted()).ok_or(AppError::NotFound)?;
            content.clone_into(&mut message.content);
            message.edited_at = Some(now);
            message.clone()
        };

        self.publish(&[FeedEvent::MessageUpdated(message.clone())]);
        Ok(message)
    }

    async fn soft_delete_message(&self, id: Uuid) -> Result<Message> {
        let (message, conversation) = {
            let mut state = self.state.lock().await;
            let now = state.tick();
            let message = state.messages.get_mut(&id).filter(|m| !m.is_deleted()).ok_or(AppError::NotFound)?;
            message.deleted_at = Some(now);
            let message = message.clone();

            let latest = state.latest_message(message.conversation_id).map(|m| (m.id, m.created_at));
            let conversation = state.conversation_mut(message.conversation_id)?;
            if let Some(recipient) = conversation.counterpart(message.sender_id)
                && message.read_at.is_none()
            {
                let unread = conversation.unread_for(recipient).saturating_sub(1);
                conversation.set_unread_for(recipient, unread);
            }
            if conversation.last_message_id == Some(message.id) {
                conversation.last_message_id = latest.map(|(id, _)| id);
                conversation.last_message_at = latest.map_or(conversation.created_at, |(_, at)| at);
            }
            conversation.updated_at = now;
            (message, conversation.clone())
        };

        self.publish(&[
            FeedEvent::MessageUpdated(message.clone()),
            FeedEvent::ConversationUpdated(ConversationUpdate::from(&conversation)),
        ]);
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        let (receipt, updated) = {
            let mut state = self.state.lock().await;
            let now = state.tick();
            if !state.conversation_mut(conversation_id)?.is_participant(reader_id) {
                return Err(AppError::Forbidden);
            }

            let mut updated = Vec::new();
            for message in state.messages.values_mut() {
                if message.conversation_id == conversation_id && message.is_unread_for(reader_id) {
                    message.read_at = Some(now);
                    updated.push(message.clone());
                }
            }
            updated.sort_by_key(Message::cursor);

            let conversation = state.conversation_mut(conversation_id)?;
            conversation.set_unread_for(reader_id, 0);
            conversation.updated_at = now;

            let receipt = ReadReceipt {
                conversation_id,
                reader_id,
                read_at: now,
                message_ids: updated.iter().map(|m| m.id).collect(),
                conversation: conversation.clone(),
            };
            (receipt, updated)
        };

        let mut events: Vec<FeedEvent> = updated.into_iter().map(FeedEvent::MessageUpdated).collect();
        events.push(FeedEvent::ConversationUpdated(ConversationUpdate::from(&receipt.conversation)));
        self.publish(&events);
        Ok(receipt)
    }

    async fn recount_unread(&self, conversation_id: Option<Uuid>) -> Result<u64> {
        let corrected = {
            let mut state = self.state.lock().await;
            let targets: Vec<Uuid> = match conversation_id {
                Some(id) => vec![id],
                None => state.conversations.keys().copied().collect(),
            };

            let mut corrected = Vec::new();
            for id in targets {
                let Some(conversation) = state.conversations.get(&id) else { continue };
                let buyer = state.unread_count(conversation, conversation.buyer_id);
                let seller = state.unread_count(conversation, conversation.seller_id);
                if buyer == conversation.buyer_unread_count && seller == conversation.seller_unread_count {
                    continue;
                }
                let now = state.tick();
                let conversation = state.conversation_mut(id)?;
                conversation.buyer_unread_count = buyer;
                conversation.seller_unread_count = seller;
                conversation.updated_at = now;
                corrected.push(conversation.clone());
            }
            corrected
        };

        let events: Vec<FeedEvent> =
            corrected.iter().map(|c| FeedEvent::ConversationUpdated(ConversationUpdate::from(c))).collect();
        self.publish(&events);
        Ok(corrected.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageKind;

    fn key() -> ConversationKey {
        ConversationKey { buyer_id: Uuid::new_v4(), seller_id: Uuid::new_v4(), listing_id: Some(Uuid::new_v4()) }
    }

    fn text(conversation_id: Uuid, sender_id: Uuid, content: &str) -> NewMessage {
        NewMessage { conversation_id, sender_id, content: content.into(), kind: MessageKind::Text, client_message_id: None }
    }

    #[tokio::test]
    async fn test_duplicate_key_conflicts() {
        let store = InMemoryStore::new();
        let key = key();
        store.insert_conversation(&key).await.expect("first insert");

        assert!(matches!(store.insert_conversation(&key).await, Err(AppError::Conflict(_))));

        let other_bucket = ConversationKey { listing_id: None, ..key };
        assert!(store.insert_conversation(&other_bucket).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_updates_recipient_counter_and_mark_read_clears_it() {
        let store = InMemoryStore::new();
        let key = key();
        let conversation = store.insert_conversation(&key).await.expect("insert");

        store.insert_message(text(conversation.id, key.buyer_id, "hi")).await.expect("send");
        let sent = store.insert_message(text(conversation.id, key.buyer_id, "still there?")).await.expect("send");

        assert_eq!(sent.conversation.seller_unread_count, 2);
        assert_eq!(sent.conversation.buyer_unread_count, 0);
        assert_eq!(sent.conversation.last_message_id, Some(sent.message.id));

        let receipt = store.mark_read(conversation.id, key.seller_id).await.expect("mark read");
        assert_eq!(receipt.message_ids.len(), 2);
        assert_eq!(receipt.conversation.seller_unread_count, 0);

        let again = store.mark_read(conversation.id, key.seller_id).await.expect("mark read");
        assert!(again.message_ids.is_empty());
    }

    #[tokio::test]
    async fn test_soft_delete_moves_last_message_back() {
        let store = InMemoryStore::new();
        let key = key();
        let conversation = store.insert_conversation(&key).await.expect("insert");
        let first = store.insert_message(text(conversation.id, key.buyer_id, "one")).await.expect("send");
        let second = store.insert_message(text(conversation.id, key.buyer_id, "two")).await.expect("send");

        store.soft_delete_message(second.message.id).await.expect("delete");

        let conversation = store.get_conversation(conversation.id).await.expect("get").expect("exists");
        assert_eq!(conversation.last_message_id, Some(first.message.id));
        assert_eq!(conversation.seller_unread_count, 1);
        let page = store.fetch_messages(conversation.id, None, 10).await.expect("fetch");
        assert_eq!(page.len(), 1);
        assert!(matches!(store.edit_message(second.message.id, "x").await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_recount_repairs_drifted_counters() {
        let store = InMemoryStore::new();
        let key = key();
        let conversation = store.insert_conversation(&key).await.expect("insert");
        store.insert_message(text(conversation.id, key.seller_id, "hello")).await.expect("send");

        store.force_unread(conversation.id, key.buyer_id, 9).await.expect("force");
        assert_eq!(store.recount_unread(None).await.expect("recount"), 1);

        let conversation = store.get_conversation(conversation.id).await.expect("get").expect("exists");
        assert_eq!(conversation.buyer_unread_count, 1);
        assert_eq!(store.recount_unread(Some(conversation.id)).await.expect("recount"), 0);
    }

    #[tokio::test]
    async fn test_list_excludes_inactive_and_orders_by_activity() {
        let store = InMemoryStore::new();
        let buyer = Uuid::new_v4();
        let first = store
            .insert_conversation(&ConversationKey { buyer_id: buyer, seller_id: Uuid::new_v4(), listing_id: None })
            .await
            .expect("insert");
        let second = store
            .insert_conversation(&ConversationKey { buyer_id: buyer, seller_id: Uuid::new_v4(), listing_id: None })
            .await
            .expect("insert");
        let blocked = store
            .insert_conversation(&ConversationKey { buyer_id: buyer, seller_id: Uuid::new_v4(), listing_id: None })
            .await
            .expect("insert");
        store.set_conversation_status(blocked.id, ConversationStatus::Blocked).await.expect("block");
        store.insert_message(text(first.id, buyer, "bump")).await.expect("send");

        let ids: Vec<Uuid> = store.list_conversations(buyer).await.expect("list").iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
