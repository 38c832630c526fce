pub mod conversation_resolver;
pub mod conversation_store;
pub mod event_ingestor;
pub mod feed;
pub mod health_service;
pub mod message_cache;
pub mod messaging_service;
pub mod session;
pub mod store;
pub mod unread_tracker;

use crate::config::MessagingConfig;
use crate::error::{AppError, Result};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;

/// Bounds a single storage attempt. An elapsed deadline becomes `TransientNetwork`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| AppError::TransientNetwork(format!("{operation} timed out after {timeout:?}")))?
}

/// Runs an idempotent storage operation with a per-attempt timeout and bounded
/// exponential backoff on retryable errors.
pub(crate) async fn retrying<T, F, Fut>(config: &MessagingConfig, operation: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let strategy = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.retry_min_delay_ms))
        .with_max_delay(Duration::from_millis(config.retry_max_delay_ms))
        .with_max_times(config.retry_max_attempts);
    let timeout = config.request_timeout();

    (|| with_timeout(timeout, operation, f()))
        .retry(&strategy)
        .when(AppError::is_retryable)
        .notify(|e, delay| {
            tracing::debug!(error = %e, operation, "Retrying in {:?}", delay);
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> MessagingConfig {
        MessagingConfig { retry_min_delay_ms: 1, retry_max_delay_ms: 2, request_timeout_ms: 50, ..Default::default() }
    }

    #[tokio::test]
    async fn test_retrying_recovers_from_transient_errors() {
        let attempts = AtomicUsize::new(0);
        let result = retrying(&fast_config(), "probe", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::TransientNetwork("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrying_gives_up_on_permanent_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = retrying(&fast_config(), "probe", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::NotFound)
        })
        .await;

        assert!(matches!(result, Err(AppError::NotFound)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient_network() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(AppError::TransientNetwork(_))));
    }
}
