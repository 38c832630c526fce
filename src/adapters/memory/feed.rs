use crate::domain::event::{FeedEvent, FeedItem, Topic};
use crate::error::Result;
use crate::services::feed::EventFeed;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Process-local event feed. Events published while disconnected are dropped,
/// the way a real transport loses them during an outage.
#[derive(Debug)]
pub struct InMemoryFeed {
    channels: DashMap<Topic, broadcast::Sender<FeedItem>>,
    capacity: usize,
    connected: AtomicBool,
}

impl InMemoryFeed {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { channels: DashMap::new(), capacity, connected: AtomicBool::new(true) }
    }

    pub fn publish(&self, event: &FeedEvent) {
        if !self.connected.load(Ordering::Acquire) {
            tracing::debug!(?event, "Feed disconnected, dropping event");
            return;
        }
        for topic in event.topics() {
            if let Some(tx) = self.channels.get(&topic) {
                // No receivers is fine
                let _ = tx.send(FeedItem::Event(event.clone()));
            }
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Restores delivery and tells every subscriber it may have missed events.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
        for entry in &self.channels {
            let _ = entry.value().send(FeedItem::Reconnected);
        }
    }

    /// Drops the topic channel; its receivers observe `Closed`.
    pub fn close_topic(&self, topic: Topic) {
        self.channels.remove(&topic);
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.channels.get(&topic).map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EventFeed for InMemoryFeed {
    async fn subscribe(&self, topic: Topic) -> Result<broadcast::Receiver<FeedItem>> {
        let tx = self
            .channels
            .entry(topic)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(self.capacity);
                tx
            })
            .value()
            .clone();

        Ok(tx.subscribe())
    }
}
