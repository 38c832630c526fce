use crate::domain::event::{FeedItem, Topic};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Push channel of storage changes. Delivery is at-least-once and may have gaps;
/// a gap is signalled by `FeedItem::Reconnected` or a lagged receiver.
#[async_trait]
pub trait EventFeed: Send + Sync + std::fmt::Debug {
    async fn subscribe(&self, topic: Topic) -> Result<broadcast::Receiver<FeedItem>>;
}
