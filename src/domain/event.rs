use crate::domain::conversation::ConversationUpdate;
use crate::domain::message::Message;
use uuid::Uuid;

/// Feed filter: row changes of one conversation, or list changes for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(Uuid),
    User(Uuid),
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    MessageCreated(Message),
    MessageUpdated(Message),
    ConversationUpdated(ConversationUpdate),
}

impl FeedEvent {
    /// Topics a change is published on.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Self::MessageCreated(m) | Self::MessageUpdated(m) => vec![Topic::Conversation(m.conversation_id)],
            Self::ConversationUpdated(u) => vec![Topic::User(u.buyer_id), Topic::User(u.seller_id)],
        }
    }
}

/// What a feed subscriber receives. `Reconnected` means events may have been missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Event(FeedEvent),
    Reconnected,
}
