//! Per-conversation message window, owned by a single actor task.
//!
//! Storage I/O never runs inside the actor loop: each request spawns a task whose
//! result re-enters the loop as a [`Completion`]. Loads carry the epoch they were
//! issued under so a load superseded by a newer `load_initial` is discarded.

mod window;

pub use window::{CacheState, CachedMessage, Delivery, WindowSnapshot};

use crate::domain::message::{Draft, Message, MessageKind};
use crate::error::{AppError, Result};
use crate::services::conversation_store::ConversationStore;
use crate::services::messaging_service::MessagingService;
use crate::services::store::{ReadReceipt, SentMessage};
use crate::services::unread_tracker::UnreadTracker;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;
use window::MessageWindow;

#[derive(Clone, Debug)]
struct Metrics {
    superseded_total: Counter<u64>,
    send_rollbacks_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            superseded_total: meter
                .u64_counter("marketdz_cache_loads_superseded_total")
                .with_description("Page loads discarded because a newer load_initial was issued")
                .build(),
            send_rollbacks_total: meter
                .u64_counter("marketdz_cache_send_rollbacks_total")
                .with_description("Optimistic entries removed after a failed send")
                .build(),
        }
    }
}

#[derive(Debug)]
enum Command {
    LoadInitial { page_size: Option<u32>, reply: Option<oneshot::Sender<Result<()>>> },
    LoadOlder { reply: oneshot::Sender<Result<Vec<Message>>> },
    Send { draft: Draft, reply: oneshot::Sender<Result<Message>> },
    AppendLive(Message),
    ApplyUpdate(Message),
    MarkRead { reply: Option<oneshot::Sender<Result<ReadReceipt>>> },
    ScheduleMarkRead,
}

#[derive(Debug)]
enum Completion {
    Initial { epoch: u64, page_size: u32, result: Result<Vec<Message>> },
    Older { epoch: u64, page_size: u32, result: Result<Vec<Message>> },
    Sent { temp_id: Uuid, result: Result<SentMessage>, reply: oneshot::Sender<Result<Message>> },
    Read { result: Result<ReadReceipt> },
}

/// Handle to a conversation's cache actor. Cloning shares the actor; it stops once
/// every handle is dropped.
#[derive(Clone, Debug)]
pub struct MessageCache {
    conversation_id: Uuid,
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<WindowSnapshot>,
    max_content_length: usize,
}

impl MessageCache {
    /// Spawns the actor. `list`, when given, receives the conversation rows and read
    /// receipts produced by this cache's writes.
    #[must_use]
    pub fn spawn(
        conversation_id: Uuid,
        user_id: Uuid,
        service: MessagingService,
        tracker: UnreadTracker,
        list: Option<ConversationStore>,
    ) -> Self {
        let config = service.config().clone();
        let window = MessageWindow::new(conversation_id, Duration::from_secs(config.optimistic_match_window_secs));
        let (snapshot_tx, snapshot) = watch::channel(window.snapshot());
        let (tx, rx) = mpsc::channel(config.actor_queue_capacity);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let actor = CacheActor {
            conversation_id,
            user_id,
            window,
            page_size: config.page_size,
            max_page_size: config.max_page_size,
            debounce: config.mark_read_debounce(),
            service,
            tracker,
            list,
            snapshot_tx,
            completions_tx,
            metrics: Metrics::new(),
            epoch: 0,
            initial_waiters: Vec::new(),
            older_waiters: Vec::new(),
            older_in_flight: false,
            read_in_flight: false,
            read_waiters: Vec::new(),
            queued_read: None,
            mark_read_at: None,
        };

        tokio::spawn(
            actor
                .run(rx, completions_rx)
                .instrument(tracing::info_span!("message_cache", conversation.id = %conversation_id)),
        );

        Self { conversation_id, tx, snapshot, max_content_length: config.max_content_length }
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Fetches the newest page. `None` keeps the current page size.
    ///
    /// # Errors
    /// Returns the load error; the window is then in `CacheState::Error`.
    pub async fn load_initial(&self, page_size: Option<u32>) -> Result<()> {
        self.request(|reply| Command::LoadInitial { page_size, reply: Some(reply) }).await
    }

    /// Reloads the newest page without waiting for the outcome.
    pub async fn reload(&self) {
        self.enqueue(Command::LoadInitial { page_size: None, reply: None }).await;
    }

    /// Fetches the page before the oldest loaded message and returns only the new messages.
    /// Concurrent callers share one request.
    ///
    /// # Errors
    /// Returns `AppError::Validation` before the first page has loaded, or the load error.
    pub async fn load_older(&self) -> Result<Vec<Message>> {
        self.request(|reply| Command::LoadOlder { reply }).await
    }

    /// Validates and sends a message, showing it optimistically until the write settles.
    ///
    /// # Errors
    /// Returns `AppError::Validation` for blank or oversized content without touching the
    /// window, otherwise the write error after the optimistic entry is rolled back.
    pub async fn send(&self, content: &str, kind: MessageKind) -> Result<Message> {
        let draft = Draft::new(content, kind, self.max_content_length)?;
        self.send_draft(draft).await
    }

    /// # Errors
    /// See [`Self::send`].
    pub async fn send_draft(&self, draft: Draft) -> Result<Message> {
        self.request(|reply| Command::Send { draft, reply }).await
    }

    pub async fn append_live(&self, message: Message) {
        self.enqueue(Command::AppendLive(message)).await;
    }

    pub async fn apply_update(&self, message: Message) {
        self.enqueue(Command::ApplyUpdate(message)).await;
    }

    /// Marks the conversation read now. Joins an in-flight request if there is one.
    ///
    /// # Errors
    /// Returns the storage error after retries.
    pub async fn mark_read(&self) -> Result<ReadReceipt> {
        self.request(|reply| Command::MarkRead { reply: Some(reply) }).await
    }

    /// Marks the conversation read after the debounce delay; calls within the delay restart it.
    pub async fn schedule_mark_read(&self) {
        self.enqueue(Command::ScheduleMarkRead).await;
    }

    #[must_use]
    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WindowSnapshot> {
        self.snapshot.clone()
    }

    async fn enqueue(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!(conversation.id = %self.conversation_id, "Cache actor stopped, dropping command");
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await.map_err(|_| AppError::Internal)?;
        rx.await.map_err(|_| AppError::Internal)?
    }
}

struct CacheActor {
    conversation_id: Uuid,
    user_id: Uuid,
    window: MessageWindow,
    page_size: u32,
    max_page_size: u32,
    debounce: Duration,
    service: MessagingService,
    tracker: UnreadTracker,
    list: Option<ConversationStore>,
    snapshot_tx: watch::Sender<WindowSnapshot>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    metrics: Metrics,
    epoch: u64,
    initial_waiters: Vec<oneshot::Sender<Result<()>>>,
    older_waiters: Vec<oneshot::Sender<Result<Vec<Message>>>>,
    older_in_flight: bool,
    read_in_flight: bool,
    read_waiters: Vec<oneshot::Sender<Result<ReadReceipt>>>,
    /// Set when a mark-read arrives while one is in flight; holds the callers waiting for the rerun.
    queued_read: Option<Vec<oneshot::Sender<Result<ReadReceipt>>>>,
    mark_read_at: Option<Instant>,
}

impl CacheActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut completions: mpsc::UnboundedReceiver<Completion>) {
        loop {
            let deadline = self.mark_read_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.mark_read_at = None;
                    self.start_mark_read(None);
                }
            }
        }
        tracing::debug!("Cache actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LoadInitial { page_size, reply } => self.start_initial(page_size, reply),
            Command::LoadOlder { reply } => self.start_older(reply),
            Command::Send { draft, reply } => self.start_send(draft, reply),
            Command::AppendLive(message) => {
                self.window.append_live(message);
                self.publish();
            }
            Command::ApplyUpdate(message) => {
                self.window.apply_update(message);
                self.publish();
            }
            Command::MarkRead { reply } => {
                self.mark_read_at = None;
                self.start_mark_read(reply);
            }
            Command::ScheduleMarkRead => {
                self.mark_read_at = Some(Instant::now() + self.debounce);
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Initial { epoch, page_size, result } => self.finish_initial(epoch, page_size, result),
            Completion::Older { epoch, page_size, result } => self.finish_older(epoch, page_size, result),
            Completion::Sent { temp_id, result, reply } => self.finish_send(temp_id, result, reply),
            Completion::Read { result } => self.finish_mark_read(result),
        }
    }

    fn start_initial(&mut self, page_size: Option<u32>, reply: Option<oneshot::Sender<Result<()>>>) {
        if let Some(page_size) = page_size {
            self.page_size = page_size.clamp(1, self.max_page_size);
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let page_size = self.page_size;
        self.initial_waiters.extend(reply);

        // A pending load_older belongs to the superseded epoch.
        if self.older_in_flight {
            self.older_in_flight = false;
            self.metrics.superseded_total.add(1, &[KeyValue::new("load", "older")]);
            for waiter in self.older_waiters.drain(..) {
                let _ = waiter.send(Ok(Vec::new()));
            }
        }

        self.window.begin_initial();
        self.publish();

        let service = self.service.clone();
        let conversation_id = self.conversation_id;
        self.spawn_io(async move {
            let result = service.fetch_before(conversation_id, None, page_size).await;
            Completion::Initial { epoch, page_size, result }
        });
    }

    fn finish_initial(&mut self, epoch: u64, page_size: u32, result: Result<Vec<Message>>) {
        if epoch != self.epoch {
            tracing::debug!(epoch, current = self.epoch, "Discarding superseded initial load");
            self.metrics.superseded_total.add(1, &[KeyValue::new("load", "initial")]);
            return;
        }

        let outcome = match result {
            Ok(fetched) => {
                self.window.complete_initial(fetched, page_size);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial load failed");
                self.window.fail(e.clone());
                Err(e)
            }
        };
        self.publish();
        for waiter in self.initial_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn start_older(&mut self, reply: oneshot::Sender<Result<Vec<Message>>>) {
        if self.older_in_flight {
            self.older_waiters.push(reply);
            return;
        }
        if !self.window.has_more() {
            let _ = reply.send(Ok(Vec::new()));
            return;
        }
        let Some(cursor) = self.window.cursor().filter(|_| self.window.can_load_older()) else {
            let _ = reply.send(Err(AppError::validation("Conversation has not finished loading")));
            return;
        };

        self.older_in_flight = true;
        self.older_waiters.push(reply);
        self.window.begin_older();
        self.publish();

        let service = self.service.clone();
        let conversation_id = self.conversation_id;
        let (epoch, page_size) = (self.epoch, self.page_size);
        self.spawn_io(async move {
            let result = service.fetch_before(conversation_id, Some(cursor), page_size).await;
            Completion::Older { epoch, page_size, result }
        });
    }

    fn finish_older(&mut self, epoch: u64, page_size: u32, result: Result<Vec<Message>>) {
        if epoch != self.epoch || !self.older_in_flight {
            tracing::debug!(epoch, current = self.epoch, "Discarding superseded older page");
            return;
        }
        self.older_in_flight = false;

        let outcome = match result {
            Ok(fetched) => Ok(self.window.complete_older(fetched, page_size)),
            Err(e) => {
                tracing::warn!(error = %e, "Loading older messages failed");
                self.window.fail(e.clone());
                Err(e)
            }
        };
        self.publish();
        for waiter in self.older_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn start_send(&mut self, mut draft: Draft, reply: oneshot::Sender<Result<Message>>) {
        let temp_id = *draft.client_message_id.get_or_insert_with(Uuid::now_v7);
        self.window.insert_pending(self.user_id, &draft, OffsetDateTime::now_utc());
        self.publish();

        let service = self.service.clone();
        let (user_id, conversation_id) = (self.user_id, self.conversation_id);
        self.spawn_io(async move {
            let result = service.send_message(user_id, conversation_id, draft).await;
            Completion::Sent { temp_id, result, reply }
        });
    }

    fn finish_send(&mut self, temp_id: Uuid, result: Result<SentMessage>, reply: oneshot::Sender<Result<Message>>) {
        let outcome = match result {
            Ok(sent) => {
                self.window.confirm(temp_id, sent.message.clone());
                if let Some(list) = &self.list {
                    list.upsert(sent.conversation);
                }
                Ok(sent.message)
            }
            Err(e) => {
                tracing::warn!(error = %e, temp_id = %temp_id, "Send failed, rolling back optimistic entry");
                self.metrics.send_rollbacks_total.add(1, &[]);
                self.window.reject(temp_id);
                Err(e)
            }
        };
        self.publish();
        let _ = reply.send(outcome);
    }

    fn start_mark_read(&mut self, reply: Option<oneshot::Sender<Result<ReadReceipt>>>) {
        if self.read_in_flight {
            self.queued_read.get_or_insert_with(Vec::new).extend(reply);
            return;
        }
        self.read_in_flight = true;
        self.read_waiters.extend(reply);

        let tracker = self.tracker.clone();
        let (user_id, conversation_id) = (self.user_id, self.conversation_id);
        self.spawn_io(async move {
            let result = tracker.mark_read(conversation_id, user_id).await;
            Completion::Read { result }
        });
    }

    fn finish_mark_read(&mut self, result: Result<ReadReceipt>) {
        self.read_in_flight = false;
        match &result {
            Ok(receipt) => {
                self.window.apply_receipt(&receipt.message_ids, receipt.read_at);
                self.publish();
                if let Some(list) = &self.list {
                    list.apply_read(receipt.clone());
                }
            }
            Err(e) => tracing::warn!(error = %e, "Mark read failed"),
        }
        for waiter in self.read_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }

        if let Some(waiters) = self.queued_read.take() {
            self.read_waiters = waiters;
            self.start_mark_read(None);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.window.snapshot());
    }

    fn spawn_io(&self, fut: impl std::future::Future<Output = Completion> + Send + 'static) {
        let completions = self.completions_tx.clone();
        tokio::spawn(
            async move {
                // The actor may have stopped meanwhile
                let _ = completions.send(fut.await);
            }
            .in_current_span(),
        );
    }
}
