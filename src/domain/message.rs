use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub url: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub event: String,
}

/// Message type together with its type-specific metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Image(ImageMetadata),
    File(FileMetadata),
    System(SystemMetadata),
}

impl MessageKind {
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image(_) => "image",
            Self::File(_) => "file",
            Self::System(_) => "system",
        }
    }

    /// Builds a kind from its wire/storage representation, validating the metadata shape for the tag.
    ///
    /// # Errors
    /// Returns `AppError::Validation` for an unknown tag or metadata that does not fit it.
    pub fn from_parts(message_type: &str, metadata: Option<serde_json::Value>) -> Result<Self> {
        let metadata = metadata.unwrap_or(serde_json::Value::Null);
        let kind = match message_type {
            "text" => {
                let empty = match &metadata {
                    serde_json::Value::Null => true,
                    serde_json::Value::Object(map) => map.is_empty(),
                    _ => false,
                };
                if !empty {
                    return Err(AppError::validation("Text messages carry no metadata"));
                }
                Self::Text
            }
            "image" => Self::Image(parse_metadata(metadata, "image")?),
            "file" => Self::File(parse_metadata(metadata, "file")?),
            "system" => Self::System(parse_metadata(metadata, "system")?),
            other => return Err(AppError::validation(format!("Unknown message type: {other}"))),
        };
        kind.validate()?;
        Ok(kind)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Text => Ok(()),
            Self::Image(meta) => validate_url(&meta.url),
            Self::File(meta) => {
                validate_url(&meta.url)?;
                if meta.file_name.trim().is_empty() {
                    return Err(AppError::validation("File messages require a file_name"));
                }
                Ok(())
            }
            Self::System(meta) => {
                if meta.event.trim().is_empty() {
                    return Err(AppError::validation("System messages require an event"));
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        let value = match self {
            Self::Text => Ok(serde_json::Value::Object(serde_json::Map::new())),
            Self::Image(meta) => serde_json::to_value(meta),
            Self::File(meta) => serde_json::to_value(meta),
            Self::System(meta) => serde_json::to_value(meta),
        };
        value.unwrap_or_default()
    }
}

fn parse_metadata<T: serde::de::DeserializeOwned>(value: serde_json::Value, tag: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| AppError::validation(format!("Invalid {tag} metadata: {e}")))
}

fn validate_url(url: &str) -> Result<()> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(AppError::validation("Attachment url must be http(s)"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    /// Sender-generated temp id correlating an optimistic entry with this row.
    pub client_message_id: Option<Uuid>,
    pub read_at: Option<OffsetDateTime>,
    pub edited_at: Option<OffsetDateTime>,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Message {
    #[must_use]
    pub const fn cursor(&self) -> MessageCursor {
        MessageCursor { created_at: self.created_at, id: self.id }
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True when this message counts toward `user_id`'s unread counter.
    #[must_use]
    pub fn is_unread_for(&self, user_id: Uuid) -> bool {
        self.sender_id != user_id && self.read_at.is_none() && self.deleted_at.is_none()
    }
}

/// Position in the `(created_at, id)` total order. Field order makes the derived `Ord` match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageCursor {
    pub created_at: OffsetDateTime,
    pub id: Uuid,
}

impl fmt::Display for MessageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.created_at.unix_timestamp_nanos(), self.id)
    }
}

impl FromStr for MessageCursor {
    type Err = AppError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || AppError::validation("Malformed cursor");
        let (nanos, id) = s.split_once('_').ok_or_else(invalid)?;
        let nanos: i128 = nanos.parse().map_err(|_| invalid())?;
        let created_at = OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| invalid())?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self { created_at, id })
    }
}

/// Validated outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub kind: MessageKind,
    pub client_message_id: Option<Uuid>,
}

impl Draft {
    /// # Errors
    /// Returns `AppError::Validation` if the content is blank or too long, or the kind is `System`.
    pub fn new(content: &str, kind: MessageKind, max_length: usize) -> Result<Self> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::validation("Message content is required"));
        }
        if content.chars().count() > max_length {
            return Err(AppError::validation(format!("Message content exceeds {max_length} characters")));
        }
        if matches!(kind, MessageKind::System(_)) {
            return Err(AppError::validation("System messages cannot be sent by participants"));
        }
        Ok(Self { content: content.to_string(), kind, client_message_id: None })
    }

    #[must_use]
    pub const fn with_client_id(mut self, client_message_id: Uuid) -> Self {
        self.client_message_id = Some(client_message_id);
        self
    }
}

/// One page of messages in ascending display order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Page {
    pub messages: Vec<Message>,
    pub has_more: bool,
    /// Cursor for the next (older) page.
    pub next_cursor: Option<MessageCursor>,
}

impl Page {
    /// Builds a page from a newest-first fetch of at most `limit` rows.
    #[must_use]
    pub fn from_descending(mut fetched: Vec<Message>, limit: u32) -> Self {
        let has_more = fetched.len() == limit as usize;
        fetched.reverse();
        let next_cursor = fetched.first().map(Message::cursor);
        Self { messages: fetched, has_more, next_cursor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_parts_validates_per_tag() {
        assert_eq!(MessageKind::from_parts("text", None).ok(), Some(MessageKind::Text));
        assert_eq!(MessageKind::from_parts("text", Some(json!({}))).ok(), Some(MessageKind::Text));
        assert!(MessageKind::from_parts("text", Some(json!({"url": "https://x"}))).is_err());

        let image = MessageKind::from_parts("image", Some(json!({"url": "https://cdn/x.jpg", "width": 640})));
        assert!(matches!(image, Ok(MessageKind::Image(ImageMetadata { width: Some(640), .. }))));
        assert!(MessageKind::from_parts("image", Some(json!({}))).is_err());
        assert!(MessageKind::from_parts("image", Some(json!({"url": "ftp://x"}))).is_err());

        assert!(MessageKind::from_parts("file", Some(json!({"url": "https://x/a.pdf"}))).is_err());
        assert!(MessageKind::from_parts("file", Some(json!({"url": "https://x/a.pdf", "file_name": "a.pdf"}))).is_ok());

        assert!(MessageKind::from_parts("video", None).is_err());
    }

    #[test]
    fn test_metadata_round_trips_through_parts() {
        let kind = MessageKind::File(FileMetadata {
            url: "https://x/a.pdf".into(),
            file_name: "a.pdf".into(),
            size_bytes: Some(12),
            mime_type: None,
        });
        let rebuilt = MessageKind::from_parts(kind.type_name(), Some(kind.metadata()));
        assert_eq!(rebuilt.ok(), Some(kind));
    }

    #[test]
    fn test_draft_trims_and_rejects_blank() {
        let draft = Draft::new("  hello \n", MessageKind::Text, 100).expect("valid draft");
        assert_eq!(draft.content, "hello");

        assert!(matches!(Draft::new(" \t\n", MessageKind::Text, 100), Err(AppError::Validation(_))));
        assert!(matches!(Draft::new("abcdef", MessageKind::Text, 5), Err(AppError::Validation(_))));
        let system = MessageKind::System(SystemMetadata { event: "listing_sold".into() });
        assert!(matches!(Draft::new("sold", system, 100), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_cursor_order_and_wire_format() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid timestamp");
        let low = MessageCursor { created_at: ts, id: Uuid::from_u128(1) };
        let high = MessageCursor { created_at: ts, id: Uuid::from_u128(2) };
        let later = MessageCursor { created_at: ts + time::Duration::nanoseconds(1), id: Uuid::from_u128(0) };

        assert!(low < high);
        assert!(high < later);

        let parsed: MessageCursor = later.to_string().parse().expect("cursor parses");
        assert_eq!(parsed, later);
        assert!("garbage".parse::<MessageCursor>().is_err());
    }
}
