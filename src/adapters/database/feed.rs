use crate::adapters::database::DbPool;
use crate::config::FeedConfig;
use crate::domain::conversation::ConversationUpdate;
use crate::domain::event::{FeedEvent, FeedItem, Topic};
use crate::error::Result;
use crate::services::feed::EventFeed;
use crate::services::store::MessageStore;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, UpDownCounter},
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::Instrument;
use uuid::Uuid;

pub(crate) const FEED_CHANNEL: &str = "messaging_events";

/// Payload of a `NOTIFY` on [`FEED_CHANNEL`]. Only ids travel; rows are re-read on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum ChangeNotice {
    MessageCreated { message_id: Uuid },
    MessageUpdated { message_id: Uuid },
    ConversationUpdated { conversation_id: Uuid },
}

#[derive(Clone, Debug)]
struct Metrics {
    received_total: Counter<u64>,
    unrouted_total: Counter<u64>,
    reconnects_total: Counter<u64>,
    active_channels: UpDownCounter<i64>,
    gc_duration_seconds: Histogram<f64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            received_total: meter
                .u64_counter("marketdz_feed_notices_received_total")
                .with_description("Change notices received from Postgres")
                .build(),
            unrouted_total: meter
                .u64_counter("marketdz_feed_notices_unrouted_total")
                .with_description("Change notices with no local subscribers")
                .build(),
            reconnects_total: meter
                .u64_counter("marketdz_feed_reconnects_total")
                .with_description("Times the LISTEN connection was re-established")
                .build(),
            active_channels: meter
                .i64_up_down_counter("marketdz_feed_active_channels")
                .with_description("Number of local topic channels")
                .build(),
            gc_duration_seconds: meter
                .f64_histogram("marketdz_feed_gc_duration_seconds")
                .with_description("Time taken to perform a single GC iteration")
                .build(),
        }
    }
}

type Channels = Arc<DashMap<Topic, broadcast::Sender<FeedItem>>>;

/// [`EventFeed`] over Postgres `LISTEN`. One listener connection per process fans
/// out to per-topic broadcast channels.
#[derive(Debug)]
pub struct PgEventFeed {
    channels: Channels,
    capacity: usize,
    metrics: Metrics,
}

impl PgEventFeed {
    /// Connects the listener and starts the dispatcher and GC tasks.
    ///
    /// # Errors
    /// Returns an error if the initial `LISTEN` fails.
    pub async fn start(
        pool: DbPool,
        store: Arc<dyn MessageStore>,
        config: &FeedConfig,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let channels: Channels = Arc::new(DashMap::new());
        let metrics = Metrics::new();
        let listener = listen(&pool).await?;

        tokio::spawn(
            run_gc(Arc::clone(&channels), metrics.clone(), config.gc_interval_secs, shutdown.clone())
                .instrument(tracing::info_span!("feed_gc")),
        );

        let dispatcher = Dispatcher { pool, store, channels: Arc::clone(&channels), config: config.clone(), metrics: metrics.clone() };
        tokio::spawn(dispatcher.run(listener, shutdown).instrument(tracing::info_span!("feed_dispatcher")));

        Ok(Self { channels, capacity: config.channel_capacity, metrics })
    }
}

#[async_trait]
impl EventFeed for PgEventFeed {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn subscribe(&self, topic: Topic) -> Result<broadcast::Receiver<FeedItem>> {
        let tx = self
            .channels
            .entry(topic)
            .or_insert_with(|| {
                self.metrics.active_channels.add(1, &[]);
                let (tx, _rx) = broadcast::channel(self.capacity);
                tx
            })
            .value()
            .clone();

        Ok(tx.subscribe())
    }
}

async fn listen(pool: &DbPool) -> std::result::Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(FEED_CHANNEL).await?;
    Ok(listener)
}

struct Dispatcher {
    pool: DbPool,
    store: Arc<dyn MessageStore>,
    channels: Channels,
    config: FeedConfig,
    metrics: Metrics,
}

impl Dispatcher {
    async fn run(self, mut listener: PgListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => self.dispatch(notification.payload()).await,
                    Ok(None) => {
                        tracing::warn!("Feed connection lost, reconnecting");
                        match self.reconnect().await {
                            Some(fresh) => listener = fresh,
                            None => break,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Feed listener failed, reconnecting");
                        match self.reconnect().await {
                            Some(fresh) => listener = fresh,
                            None => break,
                        }
                    }
                }
            }
        }
        tracing::info!("Feed dispatcher stopped");
    }

    /// Re-establishes `LISTEN` and tells every subscriber that notices may have been missed.
    async fn reconnect(&self) -> Option<PgListener> {
        let strategy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.min_backoff_ms))
            .with_max_delay(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_times(usize::MAX);

        let result = (|| listen(&self.pool))
            .retry(&strategy)
            .notify(|e, delay| {
                tracing::debug!(error = %e, "Feed reconnect retry in {:?}", delay);
            })
            .await;

        match result {
            Ok(listener) => {
                self.metrics.reconnects_total.add(1, &[]);
                tracing::info!("Feed reconnected");
                for channel in self.channels.iter() {
                    let _ = channel.value().send(FeedItem::Reconnected);
                }
                Some(listener)
            }
            Err(e) => {
                tracing::error!(error = %e, "Feed reconnect failed after retries");
                None
            }
        }
    }

    async fn dispatch(&self, payload: &str) {
        let notice: ChangeNotice = match serde_json::from_str(payload) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(error = %e, payload, "Ignoring malformed change notice");
                return;
            }
        };

        let kind = match &notice {
            ChangeNotice::MessageCreated { .. } => "message_created",
            ChangeNotice::MessageUpdated { .. } => "message_updated",
            ChangeNotice::ConversationUpdated { .. } => "conversation_updated",
        };
        self.metrics.received_total.add(1, &[KeyValue::new("kind", kind)]);

        let event = match self.resolve(notice).await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to re-read row for change notice");
                return;
            }
        };

        let mut routed = false;
        for topic in event.topics() {
            if let Some(tx) = self.channels.get(&topic)
                && tx.send(FeedItem::Event(event.clone())).is_ok()
            {
                routed = true;
            }
        }
        if !routed {
            self.metrics.unrouted_total.add(1, &[KeyValue::new("kind", kind)]);
        }
    }

    async fn resolve(&self, notice: ChangeNotice) -> Result<Option<FeedEvent>> {
        let event = match notice {
            ChangeNotice::MessageCreated { message_id } => {
                self.store.get_message(message_id).await?.map(FeedEvent::MessageCreated)
            }
            ChangeNotice::MessageUpdated { message_id } => {
                self.store.get_message(message_id).await?.map(FeedEvent::MessageUpdated)
            }
            ChangeNotice::ConversationUpdated { conversation_id } => self
                .store
                .get_conversation(conversation_id)
                .await?
                .map(|c| FeedEvent::ConversationUpdated(ConversationUpdate::from(&c))),
        };
        if event.is_none() {
            tracing::debug!("Row for change notice no longer exists");
        }
        Ok(event)
    }
}

async fn run_gc(channels: Channels, metrics: Metrics, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let start = std::time::Instant::now();
                channels.retain(|_, sender| {
                    let active = sender.receiver_count() > 0;
                    if !active {
                        metrics.active_channels.add(-1, &[]);
                    }
                    active
                });
                metrics.gc_duration_seconds.record(start.elapsed().as_secs_f64(), &[]);
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_wire_format() {
        let id = Uuid::from_u128(7);
        let json = serde_json::to_value(ChangeNotice::MessageCreated { message_id: id }).expect("serializes");
        assert_eq!(json["kind"], "message_created");
        assert_eq!(json["message_id"], id.to_string());

        let parsed: ChangeNotice =
            serde_json::from_str(&format!(r#"{{"kind":"conversation_updated","conversation_id":"{id}"}}"#))
                .expect("parses");
        assert_eq!(parsed, ChangeNotice::ConversationUpdated { conversation_id: id });
    }
}
