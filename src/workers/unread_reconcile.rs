use crate::config::WorkerConfig;
use crate::error::AppError;
use crate::services::unread_tracker::UnreadTracker;
use std::time::Duration;
use tracing::Instrument;

/// Periodically recomputes every stored unread counter from the messages table.
#[derive(Debug)]
pub struct UnreadReconcileWorker {
    tracker: UnreadTracker,
    config: WorkerConfig,
}

impl UnreadReconcileWorker {
    #[must_use]
    pub const fn new(tracker: UnreadTracker, config: WorkerConfig) -> Self {
        Self { tracker, config }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_secs));

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once()
                        .instrument(tracing::info_span!("unread_reconcile_iteration"))
                        .await
                    {
                        tracing::error!(error = ?e, "Unread reconcile iteration failed");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Unread reconcile loop shutting down...");
    }

    /// # Errors
    /// Returns an error if the recount fails after retries.
    #[tracing::instrument(skip(self), err, fields(corrected = tracing::field::Empty))]
    pub async fn reconcile_once(&self) -> Result<u64, AppError> {
        let corrected = self.tracker.reconcile(None).await?;
        tracing::Span::current().record("corrected", corrected);
        Ok(corrected)
    }
}
