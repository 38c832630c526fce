use crate::config::MessagingConfig;
use crate::error::{AppError, Result};
use crate::services::retrying;
use crate::services::store::{MessageStore, ReadReceipt};
use opentelemetry::{global, metrics::Counter};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    marked_total: Counter<u64>,
    corrected_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            marked_total: meter
                .u64_counter("marketdz_messages_marked_read_total")
                .with_description("Messages marked read")
                .build(),
            corrected_total: meter
                .u64_counter("marketdz_unread_counters_corrected_total")
                .with_description("Conversations whose stored unread counters drifted and were repaired")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UnreadTracker {
    store: Arc<dyn MessageStore>,
    config: MessagingConfig,
    metrics: Metrics,
}

impl UnreadTracker {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: MessagingConfig) -> Self {
        Self { store, config, metrics: Metrics::new() }
    }

    /// Marks every unread inbound message of the conversation as read and zeroes the caller's counter.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` for an unknown conversation, `AppError::Forbidden`
    /// if the caller is not a participant, or the storage error after retries.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(conversation_id = %conversation_id))]
    pub async fn mark_read(&self, conversation_id: Uuid, caller: Uuid) -> Result<ReadReceipt> {
        let conversation = retrying(&self.config, "get_conversation", || self.store.get_conversation(conversation_id))
            .await?
            .ok_or(AppError::NotFound)?;
        if !conversation.is_participant(caller) {
            return Err(AppError::Forbidden);
        }

        let receipt = retrying(&self.config, "mark_read", || self.store.mark_read(conversation_id, caller)).await?;
        self.metrics.marked_total.add(receipt.message_ids.len() as u64, &[]);
        Ok(receipt)
    }

    /// Recomputes stored counters from messages, for one conversation or all of them.
    ///
    /// # Errors
    /// Returns the storage error after retries.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn reconcile(&self, conversation_id: Option<Uuid>) -> Result<u64> {
        let corrected = retrying(&self.config, "recount_unread", || self.store.recount_unread(conversation_id)).await?;
        if corrected > 0 {
            tracing::warn!(corrected, "Repaired drifted unread counters");
            self.metrics.corrected_total.add(corrected, &[]);
        }
        Ok(corrected)
    }
}
