#![allow(dead_code)]

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header, encode};
use marketdz_messaging::adapters::memory::{InMemoryFeed, InMemoryStore};
use marketdz_messaging::config::{Config, FeedConfig, MessagingConfig};
use marketdz_messaging::domain::conversation::{Conversation, ConversationKey, ConversationStatus};
use marketdz_messaging::domain::identity::{Claims, IdentityProvider};
use marketdz_messaging::domain::message::{Message, MessageCursor};
use marketdz_messaging::error::{AppError, Result};
use marketdz_messaging::services::session::MessagingSession;
use marketdz_messaging::services::store::{MessageStore, NewMessage, ReadReceipt, SentMessage};
use marketdz_messaging::AppBuilder;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret";

static INIT: Once = Once::new();

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("marketdz_messaging=debug".parse().unwrap())
            .add_directive("tower=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// Short delays so debounce and retry paths finish quickly.
pub fn messaging_config() -> MessagingConfig {
    MessagingConfig {
        request_timeout_ms: 1000,
        mark_read_debounce_ms: 50,
        retry_min_delay_ms: 5,
        retry_max_delay_ms: 20,
        ..MessagingConfig::default()
    }
}

pub fn feed_config() -> FeedConfig {
    FeedConfig { min_backoff_ms: 5, max_backoff_ms: 20, ..FeedConfig::default() }
}

pub fn get_test_config() -> Config {
    use clap::Parser;
    let mut config = Config::parse_from([
        "marketdz-messaging",
        "--database-url",
        "postgres://unused/unused",
        "--jwt-secret",
        JWT_SECRET,
        "--host",
        "127.0.0.1",
        "--port",
        "0",
    ]);
    config.messaging = messaging_config();
    config.feed = feed_config();
    config
}

pub fn issue_token(user_id: Uuid) -> String {
    encode(&Header::default(), &Claims::new(user_id, 10_000_000_000), &EncodingKey::from_secret(JWT_SECRET.as_bytes()))
        .unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct StaticIdentity(pub Option<Uuid>);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<Uuid> {
        self.0
    }
}

/// In-memory store and feed shared by every session of a test.
#[derive(Debug, Clone)]
pub struct TestEnv {
    pub feed: Arc<InMemoryFeed>,
    pub store: Arc<InMemoryStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        setup_tracing();
        let feed = Arc::new(InMemoryFeed::new(64));
        let store = Arc::new(InMemoryStore::with_feed(Arc::clone(&feed)));
        Self { feed, store }
    }

    pub async fn sign_in(&self, user_id: Uuid) -> MessagingSession {
        self.sign_in_with(user_id, self.store.clone()).await
    }

    pub async fn sign_in_with(&self, user_id: Uuid, store: Arc<dyn MessageStore>) -> MessagingSession {
        MessagingSession::sign_in(&StaticIdentity(Some(user_id)), store, self.feed.clone(), messaging_config(), feed_config())
            .await
            .unwrap()
    }

    /// Creates the (buyer, seller, no listing) conversation directly in the store.
    pub async fn conversation(&self, buyer_id: Uuid, seller_id: Uuid) -> Conversation {
        self.store.insert_conversation(&ConversationKey { buyer_id, seller_id, listing_id: None }).await.unwrap()
    }

    /// Stores a text message without going through any session.
    pub async fn seed(&self, conversation_id: Uuid, sender_id: Uuid, content: &str) -> Message {
        self.store
            .insert_message(NewMessage {
                conversation_id,
                sender_id,
                content: content.to_string(),
                kind: Default::default(),
                client_message_id: None,
            })
            .await
            .unwrap()
            .message
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Decorates a store with scripted latency and failures.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<dyn MessageStore>,
    fetch_delays: Mutex<VecDeque<Duration>>,
    failing_fetches: AtomicUsize,
    failing_reads: AtomicUsize,
    fail_sends: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    pub fetch_calls: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn MessageStore>) -> Self {
        Self {
            inner,
            fetch_delays: Mutex::new(VecDeque::new()),
            failing_fetches: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            send_delay: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            mark_read_calls: AtomicUsize::new(0),
        }
    }

    /// Delays for the next fetches, consumed in call order.
    pub fn delay_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.fetch_delays.lock().unwrap().extend(delays);
    }

    pub fn fail_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn fail_mark_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn delay_sends(&self, delay: Option<Duration>) {
        *self.send_delay.lock().unwrap() = delay;
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.inner.find_conversation(key).await
    }

    async fn insert_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        self.inner.insert_conversation(key).await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.inner.list_conversations(user_id).await
    }

    async fn set_conversation_status(&self, id: Uuid, status: ConversationStatus) -> Result<Conversation> {
        self.inner.set_conversation_status(id, status).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<SentMessage> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AppError::TransientNetwork("scripted send failure".into()));
        }
        self.inner.insert_message(message).await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.inner.get_message(id).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_fetches) {
            return Err(AppError::TransientNetwork("scripted fetch failure".into()));
        }
        self.inner.fetch_messages(conversation_id, before, limit).await
    }

    async fn edit_message(&self, id: Uuid, content: &str) -> Result<Message> {
        self.inner.edit_message(id, content).await
    }

    async fn soft_delete_message(&self, id: Uuid) -> Result<Message> {
        self.inner.soft_delete_message(id).await
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(AppError::TransientNetwork("scripted mark_read failure".into()));
        }
        self.inner.mark_read(conversation_id, reader_id).await
    }

    async fn recount_unread(&self, conversation_id: Option<Uuid>) -> Result<u64> {
        self.inner.recount_unread(conversation_id).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

/// The public API served on an ephemeral port over the in-memory adapters.
#[derive(Debug)]
pub struct TestApp {
    pub env: TestEnv,
    pub server_url: String,
    pub ws_url: String,
    pub client: reqwest::Client,
    pub shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let env = TestEnv::new();
        let config = get_test_config();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let app = AppBuilder::new(config.clone())
            .with_store(env.store.clone())
            .with_feed(env.feed.clone())
            .build()
            .unwrap();
        let router = marketdz_messaging::api::app_router(config, app.services, shutdown_rx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut rx = shutdown_rx;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.wait_for(|&s| s).await;
                })
                .await
                .unwrap();
        });

        Self {
            env,
            server_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/v1/gateway"),
            client: reqwest::Client::new(),
            shutdown_tx,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }
}
