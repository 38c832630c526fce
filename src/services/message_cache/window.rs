use crate::domain::message::{Draft, Message, MessageCursor, Page};
use crate::error::AppError;
use std::collections::HashSet;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Loading,
    Ready,
    LoadingMore,
    /// Last load failed. `load_initial` and `load_older` may be re-issued.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Optimistic entry awaiting its durable write.
    Pending { temp_id: Uuid },
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub message: Message,
    pub delivery: Delivery,
}

impl CachedMessage {
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }

    fn temp_id(&self) -> Option<Uuid> {
        match self.delivery {
            Delivery::Pending { temp_id } => Some(temp_id),
            Delivery::Confirmed => None,
        }
    }
}

/// Read-only view of one conversation's window.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub conversation_id: Uuid,
    pub state: CacheState,
    pub has_more: bool,
    /// Ascending by `(created_at, id)`, no duplicate ids.
    pub messages: Vec<CachedMessage>,
    pub last_error: Option<AppError>,
}

impl WindowSnapshot {
    #[must_use]
    pub fn message_ids(&self) -> Vec<Uuid> {
        self.messages.iter().map(|m| m.message.id).collect()
    }
}

/// Ordered message window of a single conversation. Every entry, pending ones included,
/// is kept sorted by cursor; pending entries get a timestamp no older than the newest entry.
#[derive(Debug)]
pub(crate) struct MessageWindow {
    conversation_id: Uuid,
    state: CacheState,
    entries: Vec<CachedMessage>,
    has_more: bool,
    /// Oldest loaded position; `load_older` fetches strictly before it.
    cursor: Option<MessageCursor>,
    last_error: Option<AppError>,
    match_window: Duration,
    /// Confirmed ids merged since the last `begin_initial`. Only these outlive a reload
    /// that does not return them.
    arrived: HashSet<Uuid>,
}

impl MessageWindow {
    pub(crate) fn new(conversation_id: Uuid, match_window: std::time::Duration) -> Self {
        Self {
            conversation_id,
            state: CacheState::Uninitialized,
            entries: Vec::new(),
            has_more: false,
            cursor: None,
            last_error: None,
            match_window: Duration::try_from(match_window).unwrap_or(Duration::seconds(10)),
            arrived: HashSet::new(),
        }
    }

    pub(crate) const fn state(&self) -> CacheState {
        self.state
    }

    pub(crate) const fn cursor(&self) -> Option<MessageCursor> {
        self.cursor
    }

    pub(crate) fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            conversation_id: self.conversation_id,
            state: self.state,
            has_more: self.has_more,
            messages: self.entries.clone(),
            last_error: self.last_error.clone(),
        }
    }

    pub(crate) fn begin_initial(&mut self) {
        self.state = CacheState::Loading;
        self.last_error = None;
        self.arrived.clear();
    }

    /// Installs the newest page. Pending entries not yet confirmed by the page survive, as do
    /// confirmed entries newer than the page that arrived after the load began. Anything else
    /// missing from the page is gone from storage.
    pub(crate) fn complete_initial(&mut self, fetched: Vec<Message>, page_size: u32) {
        let page = Page::from_descending(fetched, page_size);
        let newest = page.messages.last().map(Message::cursor);
        let page_ids: HashSet<Uuid> = page.messages.iter().map(|m| m.id).collect();
        let confirmed_temp_ids: HashSet<Uuid> = page.messages.iter().filter_map(|m| m.client_message_id).collect();

        let kept: Vec<CachedMessage> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|entry| match entry.temp_id() {
                Some(temp_id) => !confirmed_temp_ids.contains(&temp_id),
                None => {
                    self.arrived.contains(&entry.message.id)
                        && !page_ids.contains(&entry.message.id)
                        && newest.is_none_or(|newest| entry.message.cursor() > newest)
                }
            })
            .collect();

        self.entries = page
            .messages
            .into_iter()
            .filter(|m| !m.is_deleted())
            .map(|message| CachedMessage { message, delivery: Delivery::Confirmed })
            .collect();
        for entry in kept {
            self.insert_sorted(entry);
        }

        self.has_more = page.has_more;
        self.cursor = page.next_cursor;
        self.state = CacheState::Ready;
        self.last_error = None;
        self.arrived.clear();
    }

    pub(crate) fn fail(&mut self, error: AppError) {
        self.state = CacheState::Error;
        self.last_error = Some(error);
    }

    pub(crate) const fn has_more(&self) -> bool {
        self.has_more
    }

    pub(crate) const fn can_load_older(&self) -> bool {
        matches!(self.state, CacheState::Ready | CacheState::Error) && self.has_more && self.cursor.is_some()
    }

    pub(crate) fn begin_older(&mut self) {
        self.state = CacheState::LoadingMore;
        self.last_error = None;
    }

    /// Prepends an older page, skipping ids already present. Returns the messages added.
    pub(crate) fn complete_older(&mut self, fetched: Vec<Message>, page_size: u32) -> Vec<Message> {
        let page = Page::from_descending(fetched, page_size);
        let present: HashSet<Uuid> = self.entries.iter().map(|e| e.message.id).collect();

        let added: Vec<Message> =
            page.messages.into_iter().filter(|m| !m.is_deleted() && !present.contains(&m.id)).collect();
        for message in &added {
            self.insert_sorted(CachedMessage { message: message.clone(), delivery: Delivery::Confirmed });
        }

        self.has_more = page.has_more;
        if let Some(next) = page.next_cursor {
            self.cursor = Some(self.cursor.map_or(next, |current| current.min(next)));
        }
        self.state = CacheState::Ready;
        self.last_error = None;
        added
    }

    /// Adds an optimistic entry for `draft`, which must carry its temp id.
    pub(crate) fn insert_pending(&mut self, sender_id: Uuid, draft: &Draft, now: OffsetDateTime) -> Option<Uuid> {
        let temp_id = draft.client_message_id?;
        let newest = self.entries.last().map(|e| e.message.created_at);
        let created_at = newest.map_or(now, |newest| newest.max(now));

        let message = Message {
            id: temp_id,
            conversation_id: self.conversation_id,
            sender_id,
            content: draft.content.clone(),
            kind: draft.kind.clone(),
            client_message_id: Some(temp_id),
            read_at: None,
            edited_at: None,
            deleted_at: None,
            created_at,
        };
        self.insert_sorted(CachedMessage { message, delivery: Delivery::Pending { temp_id } });
        Some(temp_id)
    }

    /// Swaps the optimistic entry for the stored row. A live echo may have done so already.
    pub(crate) fn confirm(&mut self, temp_id: Uuid, message: Message) {
        self.remove_pending(temp_id);
        self.arrived.insert(message.id);
        self.upsert(message);
    }

    pub(crate) fn reject(&mut self, temp_id: Uuid) {
        self.remove_pending(temp_id);
    }

    /// Merges a message pushed by the feed.
    pub(crate) fn append_live(&mut self, message: Message) {
        if message.is_deleted() {
            self.remove(message.id);
            return;
        }

        if let Some(index) = self.matching_pending(&message) {
            self.entries.remove(index);
        }

        if self.contains(message.id) {
            self.upsert(message);
            return;
        }

        // Older than the loaded range: it belongs to a page `load_older` will fetch.
        if self.has_more
            && let Some(cursor) = self.cursor
            && message.cursor() < cursor
        {
            tracing::trace!(message_id = %message.id, "Skipping live message behind the cursor");
            return;
        }

        self.arrived.insert(message.id);
        self.insert_sorted(CachedMessage { message, delivery: Delivery::Confirmed });
    }

    /// Replaces a known message (edit, read receipt) or drops it once soft-deleted.
    pub(crate) fn apply_update(&mut self, message: Message) {
        if message.is_deleted() {
            self.remove(message.id);
        } else if self.contains(message.id) {
            self.upsert(message);
        }
    }

    pub(crate) fn apply_receipt(&mut self, message_ids: &[Uuid], read_at: OffsetDateTime) {
        let ids: HashSet<&Uuid> = message_ids.iter().collect();
        for entry in &mut self.entries {
            if ids.contains(&entry.message.id) && entry.message.read_at.is_none() {
                entry.message.read_at = Some(read_at);
            }
        }
    }

    fn matching_pending(&self, message: &Message) -> Option<usize> {
        let pending = || self.entries.iter().enumerate().filter(|(_, e)| e.is_pending());

        if let Some(client_id) = message.client_message_id
            && let Some((index, _)) = pending().find(|(_, e)| e.temp_id() == Some(client_id))
        {
            return Some(index);
        }

        // An echo carrying a temp id that matches nothing was already swapped in by `confirm`.
        if message.client_message_id.is_some() {
            return None;
        }

        pending()
            .find(|(_, e)| {
                e.message.sender_id == message.sender_id
                    && e.message.content == message.content
                    && (e.message.created_at - message.created_at).abs() <= self.match_window
            })
            .map(|(index, _)| index)
    }

    fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.message.id == id)
    }

    fn upsert(&mut self, message: Message) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message.id && !e.is_pending())
            && entry.message.created_at == message.created_at
        {
            entry.message = message;
            return;
        }
        self.remove(message.id);
        self.insert_sorted(CachedMessage { message, delivery: Delivery::Confirmed });
    }

    fn remove(&mut self, id: Uuid) {
        self.entries.retain(|e| e.message.id != id);
    }

    fn remove_pending(&mut self, temp_id: Uuid) {
        self.entries.retain(|e| e.temp_id() != Some(temp_id));
    }

    fn insert_sorted(&mut self, entry: CachedMessage) {
        let cursor = entry.message.cursor();
        let index = self.entries.partition_point(|e| e.message.cursor() <= cursor);
        self.entries.insert(index, entry);
    }
}
