use crate::config::FeedConfig;
use crate::domain::event::{FeedEvent, FeedItem, Topic};
use crate::error::Result;
use crate::services::conversation_store::ConversationStore;
use crate::services::feed::EventFeed;
use crate::services::message_cache::MessageCache;
use crate::services::messaging_service::MessagingService;
use crate::services::unread_tracker::UnreadTracker;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::{DashMap, mapref::entry::Entry};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, UpDownCounter},
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

const RESUBSCRIBE_ATTEMPTS: usize = 8;

#[derive(Clone, Debug)]
struct Metrics {
    events_total: Counter<u64>,
    resyncs_total: Counter<u64>,
    observed_conversations: UpDownCounter<i64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            events_total: meter
                .u64_counter("marketdz_feed_events_total")
                .with_description("Feed events routed into local state")
                .build(),
            resyncs_total: meter
                .u64_counter("marketdz_feed_resyncs_total")
                .with_description("Resyncs triggered by reconnects, lag or closed subscriptions")
                .build(),
            observed_conversations: meter
                .i64_up_down_counter("marketdz_observed_conversations")
                .with_description("Conversations with a live subscription")
                .build(),
        }
    }
}

#[derive(Debug)]
struct Observation {
    cache: MessageCache,
    observers: usize,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    user_id: Uuid,
    feed: Arc<dyn EventFeed>,
    service: MessagingService,
    tracker: UnreadTracker,
    list: ConversationStore,
    feed_config: FeedConfig,
    observed: DashMap<Uuid, Observation>,
    active: watch::Sender<Option<Uuid>>,
    shutdown: watch::Sender<bool>,
    metrics: Metrics,
}

impl Inner {
    fn join(&self, conversation_id: Uuid) -> Option<MessageCache> {
        self.observed.get_mut(&conversation_id).map(|mut observation| {
            observation.observers += 1;
            observation.cache.clone()
        })
    }

    fn release(&self, conversation_id: Uuid) {
        let Entry::Occupied(mut entry) = self.observed.entry(conversation_id) else {
            return;
        };
        if entry.get().observers > 1 {
            entry.get_mut().observers -= 1;
            return;
        }

        entry.remove().task.abort();
        self.metrics.observed_conversations.add(-1, &[]);
        self.active.send_if_modified(|active| {
            let viewing = *active == Some(conversation_id);
            if viewing {
                *active = None;
            }
            viewing
        });
        tracing::debug!(conversation.id = %conversation_id, "Stopped observing conversation");
    }
}

/// Keeps the live subscriptions of one signed-in user and routes their events into
/// the conversation list and the observed conversations' caches.
#[derive(Debug)]
pub struct EventIngestor {
    inner: Arc<Inner>,
    user_task: JoinHandle<()>,
}

impl EventIngestor {
    /// Subscribes to the user's topic and starts routing its events.
    ///
    /// # Errors
    /// Returns `AppError::Subscription` if the feed refuses the subscription.
    pub async fn start(
        user_id: Uuid,
        feed: Arc<dyn EventFeed>,
        service: MessagingService,
        tracker: UnreadTracker,
        list: ConversationStore,
        feed_config: FeedConfig,
    ) -> Result<Self> {
        let topic = Topic::User(user_id);
        let rx = feed.subscribe(topic).await?;
        let (shutdown, _) = watch::channel(false);
        let (active, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            user_id,
            feed,
            service,
            tracker,
            list,
            feed_config,
            observed: DashMap::new(),
            active,
            shutdown,
            metrics: Metrics::new(),
        });

        let router = UserRouter { list: inner.list.clone() };
        let user_task = tokio::spawn(
            follow(topic, rx, Arc::clone(&inner.feed), inner.feed_config.clone(), inner.shutdown.subscribe(), router, inner.metrics.clone())
                .instrument(tracing::info_span!("user_feed", user.id = %user_id)),
        );

        Ok(Self { inner, user_task })
    }

    /// Registers an observer of the conversation, subscribing on the first one.
    ///
    /// # Errors
    /// Returns `AppError::Subscription` if the feed refuses the subscription.
    pub async fn observe(&self, conversation_id: Uuid) -> Result<ConversationHandle> {
        let inner = &self.inner;
        let cache = if let Some(cache) = inner.join(conversation_id) {
            cache
        } else {
            let topic = Topic::Conversation(conversation_id);
            let rx = inner.feed.subscribe(topic).await?;
            let fresh = MessageCache::spawn(
                conversation_id,
                inner.user_id,
                inner.service.clone(),
                inner.tracker.clone(),
                Some(inner.list.clone()),
            );

            match inner.observed.entry(conversation_id) {
                // Another observer won the race; the fresh cache is dropped and its actor exits.
                Entry::Occupied(mut entry) => {
                    entry.get_mut().observers += 1;
                    entry.get().cache.clone()
                }
                Entry::Vacant(entry) => {
                    let router = ConversationRouter {
                        conversation_id,
                        user_id: inner.user_id,
                        cache: fresh.clone(),
                        list: inner.list.clone(),
                        active: inner.active.subscribe(),
                    };
                    let task = tokio::spawn(
                        follow(
                            topic,
                            rx,
                            Arc::clone(&inner.feed),
                            inner.feed_config.clone(),
                            inner.shutdown.subscribe(),
                            router,
                            inner.metrics.clone(),
                        )
                        .instrument(tracing::info_span!("conversation_feed", conversation.id = %conversation_id)),
                    );
                    entry.insert(Observation { cache: fresh.clone(), observers: 1, task });
                    inner.metrics.observed_conversations.add(1, &[]);
                    tracing::debug!(conversation.id = %conversation_id, "Observing conversation");
                    fresh
                }
            }
        };

        Ok(ConversationHandle { conversation_id, cache, inner: Arc::downgrade(&self.inner) })
    }

    /// Cache of an observed conversation, if any observer holds it open.
    #[must_use]
    pub fn cache(&self, conversation_id: Uuid) -> Option<MessageCache> {
        self.inner.observed.get(&conversation_id).map(|o| o.cache.clone())
    }

    #[must_use]
    pub fn observer_count(&self, conversation_id: Uuid) -> usize {
        self.inner.observed.get(&conversation_id).map_or(0, |o| o.observers)
    }

    /// The conversation currently in view, which receives automatic read receipts.
    #[must_use]
    pub fn active(&self) -> Option<Uuid> {
        *self.inner.active.borrow()
    }

    /// Stops every subscription. Caches held by outstanding handles stop receiving events.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.user_task.abort();
        let observed: Vec<Uuid> = self.inner.observed.iter().map(|o| *o.key()).collect();
        for conversation_id in observed {
            if let Some((_, observation)) = self.inner.observed.remove(&conversation_id) {
                observation.task.abort();
                self.inner.metrics.observed_conversations.add(-1, &[]);
            }
        }
    }
}

impl Drop for EventIngestor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Observer guard for one conversation. Dropping the last guard tears the subscription down.
#[derive(Debug)]
pub struct ConversationHandle {
    conversation_id: Uuid,
    cache: MessageCache,
    inner: Weak<Inner>,
}

impl ConversationHandle {
    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub const fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Marks this conversation as the one in view.
    pub fn focus(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.active.send_replace(Some(self.conversation_id));
        }
    }

    pub fn blur(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.active.send_if_modified(|active| {
                let viewing = *active == Some(self.conversation_id);
                if viewing {
                    *active = None;
                }
                viewing
            });
        }
    }
}

impl Drop for ConversationHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release(self.conversation_id);
        }
    }
}

#[async_trait]
trait Route: Send + Sync + 'static {
    async fn event(&self, event: FeedEvent);

    /// Rebuilds state after events may have been missed.
    async fn resync(&self);
}

struct UserRouter {
    list: ConversationStore,
}

#[async_trait]
impl Route for UserRouter {
    async fn event(&self, event: FeedEvent) {
        match event {
            FeedEvent::ConversationUpdated(update) => self.list.merge(update),
            other => tracing::trace!(?other, "Ignoring message event on user topic"),
        }
    }

    async fn resync(&self) {
        self.list.request_refresh();
    }
}

struct ConversationRouter {
    conversation_id: Uuid,
    user_id: Uuid,
    cache: MessageCache,
    list: ConversationStore,
    active: watch::Receiver<Option<Uuid>>,
}

#[async_trait]
impl Route for ConversationRouter {
    async fn event(&self, event: FeedEvent) {
        match event {
            FeedEvent::MessageCreated(message) => {
                let inbound = message.is_unread_for(self.user_id);
                let viewing = *self.active.borrow() == Some(self.conversation_id);
                self.cache.append_live(message.clone()).await;
                if inbound {
                    self.list.record_inbound(message);
                    if viewing {
                        self.cache.schedule_mark_read().await;
                    }
                }
            }
            FeedEvent::MessageUpdated(message) => self.cache.apply_update(message).await,
            FeedEvent::ConversationUpdated(update) => self.list.merge(update),
        }
    }

    async fn resync(&self) {
        self.cache.reload().await;
    }
}

async fn follow<R: Route>(
    topic: Topic,
    mut rx: broadcast::Receiver<FeedItem>,
    feed: Arc<dyn EventFeed>,
    config: FeedConfig,
    mut shutdown: watch::Receiver<bool>,
    router: R,
    metrics: Metrics,
) {
    let kind = match topic {
        Topic::Conversation(_) => "conversation",
        Topic::User(_) => "user",
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Ok(FeedItem::Event(event)) => {
                    metrics.events_total.add(1, &[KeyValue::new("topic", kind)]);
                    router.event(event).await;
                }
                Ok(FeedItem::Reconnected) => {
                    tracing::info!("Feed reconnected, resyncing");
                    metrics.resyncs_total.add(1, &[KeyValue::new("reason", "reconnected")]);
                    router.resync().await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged behind the feed, resyncing");
                    metrics.resyncs_total.add(1, &[KeyValue::new("reason", "lagged")]);
                    router.resync().await;
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("Feed subscription closed, resubscribing");
                    match resubscribe(feed.as_ref(), topic, &config).await {
                        Ok(fresh) => {
                            rx = fresh;
                            metrics.resyncs_total.add(1, &[KeyValue::new("reason", "closed")]);
                            router.resync().await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Giving up on feed subscription");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn resubscribe(feed: &dyn EventFeed, topic: Topic, config: &FeedConfig) -> Result<broadcast::Receiver<FeedItem>> {
    let strategy = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_backoff_ms))
        .with_max_delay(Duration::from_millis(config.max_backoff_ms))
        .with_max_times(RESUBSCRIBE_ATTEMPTS);

    (|| feed.subscribe(topic))
        .retry(&strategy)
        .notify(|e, delay| {
            tracing::debug!(error = %e, "Resubscribe retry in {:?}", delay);
        })
        .await
}
