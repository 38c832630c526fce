use crate::config::MessagingConfig;
use crate::domain::conversation::{Conversation, ConversationKey};
use crate::error::{AppError, Result};
use crate::services::store::MessageStore;
use crate::services::{retrying, with_timeout};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use uuid::Uuid;

const MAX_ATTEMPTS: usize = 3;

#[derive(Clone, Debug)]
struct Metrics {
    resolved_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            resolved_total: meter
                .u64_counter("marketdz_conversations_resolved_total")
                .with_description("Conversation lookups by outcome")
                .build(),
        }
    }
}

/// Finds or creates the single conversation for a buyer/seller/listing tuple.
#[derive(Clone, Debug)]
pub struct ConversationResolver {
    store: Arc<dyn MessageStore>,
    config: MessagingConfig,
    metrics: Metrics,
}

impl ConversationResolver {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: MessagingConfig) -> Self {
        Self { store, config, metrics: Metrics::new() }
    }

    /// Returns the conversation for `(buyer_id, seller_id, listing_id)`, creating it if needed.
    /// Concurrent callers for the same tuple all receive the same row.
    ///
    /// # Errors
    /// Returns `AppError::Validation` if buyer and seller are the same user.
    /// Returns `AppError::AuthError` if `caller` is neither party.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(caller = %caller))]
    pub async fn get_or_create(
        &self,
        caller: Uuid,
        buyer_id: Uuid,
        seller_id: Uuid,
        listing_id: Option<Uuid>,
    ) -> Result<Conversation> {
        if buyer_id == seller_id {
            return Err(AppError::validation("Buyer and seller must be different users"));
        }
        if caller != buyer_id && caller != seller_id {
            return Err(AppError::AuthError);
        }

        let key = ConversationKey { buyer_id, seller_id, listing_id };
        for attempt in 1..=MAX_ATTEMPTS {
            if let Some(existing) = retrying(&self.config, "find_conversation", || self.store.find_conversation(&key)).await? {
                self.metrics.resolved_total.add(1, &[KeyValue::new("outcome", "existing")]);
                return Ok(existing);
            }

            match with_timeout(self.config.request_timeout(), "insert_conversation", self.store.insert_conversation(&key))
                .await
            {
                Ok(created) => {
                    tracing::info!(conversation_id = %created.id, "Conversation created");
                    self.metrics.resolved_total.add(1, &[KeyValue::new("outcome", "created")]);
                    return Ok(created);
                }
                Err(AppError::Conflict(_)) => {
                    tracing::debug!(attempt, "Lost creation race, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Conflict("Conversation could not be resolved".into()))
    }
}
