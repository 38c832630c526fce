use crate::error::AppError;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationStatus {
    Active,
    Archived,
    Blocked,
}

impl ConversationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "blocked" => Ok(Self::Blocked),
            other => Err(AppError::validation(format!("Unknown conversation status: {other}"))),
        }
    }
}

/// Which side of a conversation a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Buyer,
    Seller,
}

/// Identity of a conversation. `listing_id = None` is its own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub listing_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub listing_id: Option<Uuid>,
    pub last_message_id: Option<Uuid>,
    pub last_message_at: OffsetDateTime,
    pub buyer_unread_count: u32,
    pub seller_unread_count: u32,
    pub status: ConversationStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Conversation {
    #[must_use]
    pub const fn key(&self) -> ConversationKey {
        ConversationKey { buyer_id: self.buyer_id, seller_id: self.seller_id, listing_id: self.listing_id }
    }

    #[must_use]
    pub fn party_of(&self, user_id: Uuid) -> Option<Party> {
        if user_id == self.buyer_id {
            Some(Party::Buyer)
        } else if user_id == self.seller_id {
            Some(Party::Seller)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.party_of(user_id).is_some()
    }

    /// The other participant, if `user_id` is one of the two.
    #[must_use]
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        self.party_of(user_id).map(|party| match party {
            Party::Buyer => self.seller_id,
            Party::Seller => self.buyer_id,
        })
    }

    #[must_use]
    pub fn unread_for(&self, user_id: Uuid) -> u32 {
        match self.party_of(user_id) {
            Some(Party::Buyer) => self.buyer_unread_count,
            Some(Party::Seller) => self.seller_unread_count,
            None => 0,
        }
    }

    pub(crate) fn set_unread_for(&mut self, user_id: Uuid, count: u32) {
        match self.party_of(user_id) {
            Some(Party::Buyer) => self.buyer_unread_count = count,
            Some(Party::Seller) => self.seller_unread_count = count,
            None => {}
        }
    }

    /// Moves the last-message pointer to `message_id` unless a newer message already holds it.
    pub(crate) fn record_last_message(&mut self, message_id: Uuid, at: OffsetDateTime) {
        if at >= self.last_message_at {
            self.last_message_id = Some(message_id);
            self.last_message_at = at;
        }
    }

    /// Applies the fields present in `update`. Staleness is the caller's concern.
    pub fn apply(&mut self, update: &ConversationUpdate) {
        // The last message travels as a pair; a missing id next to a timestamp means none is left.
        if let Some(at) = update.last_message_at {
            self.last_message_at = at;
            self.last_message_id = update.last_message_id;
        }
        if let Some(count) = update.buyer_unread_count {
            self.buyer_unread_count = count;
        }
        if let Some(count) = update.seller_unread_count {
            self.seller_unread_count = count;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        self.updated_at = self.updated_at.max(update.updated_at);
    }
}

/// Partial row change delivered by the event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub updated_at: OffsetDateTime,
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<OffsetDateTime>,
    pub buyer_unread_count: Option<u32>,
    pub seller_unread_count: Option<u32>,
    pub status: Option<ConversationStatus>,
}

impl From<&Conversation> for ConversationUpdate {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id,
            buyer_id: c.buyer_id,
            seller_id: c.seller_id,
            updated_at: c.updated_at,
            last_message_id: c.last_message_id,
            last_message_at: Some(c.last_message_at),
            buyer_unread_count: Some(c.buyer_unread_count),
            seller_unread_count: Some(c.seller_unread_count),
            status: Some(c.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn conversation() -> Conversation {
        let now = OffsetDateTime::now_utc();
        Conversation {
            id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            listing_id: None,
            last_message_id: None,
            last_message_at: now,
            buyer_unread_count: 2,
            seller_unread_count: 0,
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_party_resolution() {
        let c = conversation();
        assert_eq!(c.party_of(c.buyer_id), Some(Party::Buyer));
        assert_eq!(c.party_of(c.seller_id), Some(Party::Seller));
        assert_eq!(c.party_of(Uuid::new_v4()), None);
        assert_eq!(c.counterpart(c.buyer_id), Some(c.seller_id));
        assert_eq!(c.unread_for(c.buyer_id), 2);
        assert_eq!(c.unread_for(Uuid::new_v4()), 0);
    }

    #[test]
    fn test_apply_partial_update_keeps_missing_fields() {
        let mut c = conversation();
        let update = ConversationUpdate {
            id: c.id,
            buyer_id: c.buyer_id,
            seller_id: c.seller_id,
            updated_at: c.updated_at + Duration::seconds(5),
            last_message_id: None,
            last_message_at: None,
            buyer_unread_count: None,
            seller_unread_count: Some(4),
            status: Some(ConversationStatus::Archived),
        };

        c.apply(&update);

        assert_eq!(c.buyer_unread_count, 2);
        assert_eq!(c.seller_unread_count, 4);
        assert_eq!(c.status, ConversationStatus::Archived);
        assert_eq!(c.updated_at, update.updated_at);
    }

    #[test]
    fn test_apply_clears_last_message_after_its_deletion() {
        let mut c = conversation();
        c.last_message_id = Some(Uuid::new_v4());
        let mut emptied = c.clone();
        emptied.last_message_id = None;
        emptied.updated_at = c.updated_at + Duration::seconds(5);

        c.apply(&ConversationUpdate::from(&emptied));

        assert_eq!(c.last_message_id, None);
        assert_eq!(c.last_message_at, emptied.last_message_at);
    }

    #[test]
    fn test_last_message_pointer_ignores_older_commits() {
        let mut c = conversation();
        let (newer, older) = (Uuid::new_v4(), Uuid::new_v4());
        let at = c.last_message_at + Duration::seconds(2);

        c.record_last_message(newer, at);
        c.record_last_message(older, at - Duration::seconds(1));

        assert_eq!(c.last_message_id, Some(newer));
        assert_eq!(c.last_message_at, at);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("blocked".parse::<ConversationStatus>().ok(), Some(ConversationStatus::Blocked));
        assert!("deleted".parse::<ConversationStatus>().is_err());
    }
}
