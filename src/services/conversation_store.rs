use crate::domain::conversation::{Conversation, ConversationStatus, ConversationUpdate};
use crate::domain::message::Message;
use crate::error::{AppError, Result};
use crate::services::messaging_service::MessagingService;
use crate::services::store::ReadReceipt;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug)]
enum Command {
    Refresh { reply: Option<oneshot::Sender<Result<Vec<Conversation>>>> },
    Merge(ConversationUpdate),
    Upsert(Conversation),
    ApplyRead(ReadReceipt),
    RecordInbound(Message),
}

#[derive(Debug)]
enum Completion {
    Listed { epoch: u64, result: Result<Vec<Conversation>> },
}

/// Handle to the signed-in user's conversation list actor.
///
/// The caller's unread counter shown in snapshots is the stored count plus live inbound
/// messages the stored count does not cover yet. It only goes down through a read receipt
/// or an authoritative refresh.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Vec<Conversation>>,
}

impl ConversationStore {
    #[must_use]
    pub fn spawn(user_id: Uuid, service: MessagingService) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Vec::new());

        let actor = ListActor {
            user_id,
            service,
            entries: HashMap::new(),
            snapshot_tx,
            completions_tx,
            self_tx: tx.downgrade(),
            epoch: 0,
            refresh_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(rx, completions_rx).instrument(tracing::info_span!("conversation_store", user.id = %user_id)));

        Self { tx, snapshot }
    }

    /// Re-lists from storage. Overlapping refreshes are answered by the latest one.
    ///
    /// # Errors
    /// Returns the storage error; the previous list stays in place.
    pub async fn refresh(&self) -> Result<Vec<Conversation>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Refresh { reply: Some(reply) }).map_err(|_| AppError::Internal)?;
        rx.await.map_err(|_| AppError::Internal)?
    }

    pub fn request_refresh(&self) {
        self.enqueue(Command::Refresh { reply: None });
    }

    /// Applies a partial row change if it is newer than what is held.
    pub fn merge(&self, update: ConversationUpdate) {
        self.enqueue(Command::Merge(update));
    }

    /// Applies a full row returned by one of this user's own writes.
    pub fn upsert(&self, conversation: Conversation) {
        self.enqueue(Command::Upsert(conversation));
    }

    pub fn apply_read(&self, receipt: ReadReceipt) {
        self.enqueue(Command::ApplyRead(receipt));
    }

    /// Counts a confirmed inbound message toward the unread counter, once per message id.
    pub fn record_inbound(&self, message: Message) {
        self.enqueue(Command::RecordInbound(message));
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Conversation> {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Conversation>> {
        self.snapshot.clone()
    }

    fn enqueue(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Conversation list stopped, dropping command");
        }
    }
}

#[derive(Debug)]
struct Entry {
    conversation: Conversation,
    /// The caller's counter as last reported by storage.
    stored_unread: u32,
    /// Newest message time the stored counter is known to include.
    stored_as_of: OffsetDateTime,
    /// Live inbound messages newer than `stored_as_of`.
    inbound: HashMap<Uuid, OffsetDateTime>,
}

impl Entry {
    fn new(conversation: Conversation, user_id: Uuid) -> Self {
        Self {
            stored_unread: conversation.unread_for(user_id),
            stored_as_of: conversation.last_message_at,
            conversation,
            inbound: HashMap::new(),
        }
    }

    fn unread(&self) -> u32 {
        let live = u32::try_from(self.inbound.len()).unwrap_or(u32::MAX);
        self.stored_unread.saturating_add(live)
    }

    fn advance_stored(&mut self, as_of: OffsetDateTime) {
        self.stored_as_of = self.stored_as_of.max(as_of);
        let cutoff = self.stored_as_of;
        self.inbound.retain(|_, created_at| *created_at > cutoff);
    }
}

struct ListActor {
    user_id: Uuid,
    service: MessagingService,
    entries: HashMap<Uuid, Entry>,
    snapshot_tx: watch::Sender<Vec<Conversation>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    epoch: u64,
    refresh_waiters: Vec<oneshot::Sender<Result<Vec<Conversation>>>>,
}

impl ListActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut completions: mpsc::UnboundedReceiver<Completion>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(Completion::Listed { epoch, result }) = completions.recv() => self.finish_refresh(epoch, result),
            }
        }
        tracing::debug!("Conversation list actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh { reply } => self.start_refresh(reply),
            Command::Merge(update) => self.merge(&update),
            Command::Upsert(conversation) => self.upsert(conversation),
            Command::ApplyRead(receipt) => self.apply_read(receipt),
            Command::RecordInbound(message) => self.record_inbound(&message),
        }
    }

    fn start_refresh(&mut self, reply: Option<oneshot::Sender<Result<Vec<Conversation>>>>) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.refresh_waiters.extend(reply);

        let service = self.service.clone();
        let user_id = self.user_id;
        let completions = self.completions_tx.clone();
        tokio::spawn(
            async move {
                let result = service.list_conversations(user_id).await;
                let _ = completions.send(Completion::Listed { epoch, result });
            }
            .in_current_span(),
        );
    }

    fn finish_refresh(&mut self, epoch: u64, result: Result<Vec<Conversation>>) {
        if epoch != self.epoch {
            tracing::debug!(epoch, current = self.epoch, "Discarding superseded conversation list");
            return;
        }

        let outcome = match result {
            Ok(listed) => {
                let mut previous = std::mem::take(&mut self.entries);
                for conversation in listed {
                    let mut entry = Entry::new(conversation, self.user_id);
                    if let Some(old) = previous.remove(&entry.conversation.id) {
                        let cutoff = entry.stored_as_of;
                        entry.inbound = old.inbound.into_iter().filter(|(_, at)| *at > cutoff).collect();
                    }
                    self.entries.insert(entry.conversation.id, entry);
                }
                self.publish();
                Ok(self.snapshot_tx.borrow().clone())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Conversation list refresh failed");
                Err(e)
            }
        };
        for waiter in self.refresh_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn merge(&mut self, update: &ConversationUpdate) {
        let user_id = self.user_id;
        let Some(entry) = self.entries.get_mut(&update.id) else {
            if update.status.is_none_or(|s| s == ConversationStatus::Active) {
                tracing::debug!(conversation.id = %update.id, "Update for unknown conversation, refreshing");
                self.request_refresh();
            }
            return;
        };

        if update.updated_at < entry.conversation.updated_at {
            tracing::trace!(conversation.id = %update.id, "Ignoring stale conversation update");
            return;
        }

        entry.conversation.apply(update);
        let reported = if user_id == entry.conversation.buyer_id {
            update.buyer_unread_count
        } else {
            update.seller_unread_count
        };
        if let Some(count) = reported {
            entry.stored_unread = entry.stored_unread.max(count);
            if let Some(at) = update.last_message_at {
                entry.advance_stored(at);
            }
        }

        if entry.conversation.status != ConversationStatus::Active {
            self.entries.remove(&update.id);
        }
        self.publish();
    }

    fn upsert(&mut self, conversation: Conversation) {
        if self.entries.contains_key(&conversation.id) {
            self.merge(&ConversationUpdate::from(&conversation));
        } else if conversation.status == ConversationStatus::Active && conversation.is_participant(self.user_id) {
            self.entries.insert(conversation.id, Entry::new(conversation, self.user_id));
            self.publish();
        }
    }

    fn apply_read(&mut self, receipt: ReadReceipt) {
        let Some(entry) = self.entries.get_mut(&receipt.conversation_id) else {
            return;
        };

        for id in &receipt.message_ids {
            entry.inbound.remove(id);
        }
        let conversation = receipt.conversation;
        entry.stored_unread = conversation.unread_for(self.user_id);
        entry.advance_stored(conversation.last_message_at);
        if conversation.updated_at >= entry.conversation.updated_at {
            entry.conversation = conversation;
        }
        self.publish();
    }

    fn record_inbound(&mut self, message: &Message) {
        if message.sender_id == self.user_id || !message.is_unread_for(self.user_id) {
            return;
        }
        let Some(entry) = self.entries.get_mut(&message.conversation_id) else {
            self.request_refresh();
            return;
        };
        if message.created_at <= entry.stored_as_of {
            return;
        }

        entry.inbound.insert(message.id, message.created_at);
        entry.conversation.record_last_message(message.id, message.created_at);
        self.publish();
    }

    fn request_refresh(&self) {
        if let Some(tx) = self.self_tx.upgrade() {
            let _ = tx.send(Command::Refresh { reply: None });
        }
    }

    fn publish(&self) {
        let mut list: Vec<Conversation> = self
            .entries
            .values()
            .map(|entry| {
                let mut conversation = entry.conversation.clone();
                conversation.set_unread_for(self.user_id, entry.unread());
                conversation
            })
            .collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at).then(b.id.cmp(&a.id)));
        self.snapshot_tx.send_replace(list);
    }
}
