#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod telemetry;
pub mod workers;

use crate::api::ServiceContainer;
use crate::config::Config;
use crate::services::conversation_resolver::ConversationResolver;
use crate::services::feed::EventFeed;
use crate::services::health_service::HealthService;
use crate::services::messaging_service::MessagingService;
use crate::services::store::MessageStore;
use crate::services::unread_tracker::UnreadTracker;
use crate::workers::UnreadReconcileWorker;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use adapters::database::run_migrations;

/// Background loops owned by the server process.
#[derive(Debug)]
pub struct Workers {
    pub unread_reconcile: UnreadReconcileWorker,
}

impl Workers {
    #[must_use]
    pub fn spawn_all(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![tokio::spawn(self.unread_reconcile.run(shutdown_rx))]
    }
}

#[derive(Debug)]
pub struct App {
    pub services: ServiceContainer,
    pub health_service: HealthService,
    pub workers: Workers,
}

/// Wires services over a store and a feed. Storage-agnostic so tests can build
/// the full router over the in-memory adapters.
#[derive(Debug)]
pub struct AppBuilder {
    config: Config,
    store: Option<Arc<dyn MessageStore>>,
    feed: Option<Arc<dyn EventFeed>>,
}

impl AppBuilder {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config, store: None, feed: None }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_feed(mut self, feed: Arc<dyn EventFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// # Errors
    /// Returns an error if the store or feed was not provided.
    pub fn build(self) -> anyhow::Result<App> {
        let store = self.store.ok_or_else(|| anyhow::anyhow!("Message store is required"))?;
        let feed = self.feed.ok_or_else(|| anyhow::anyhow!("Event feed is required"))?;
        let messaging_config = self.config.messaging.clone();

        let messaging = MessagingService::new(Arc::clone(&store), messaging_config.clone());
        let resolver = ConversationResolver::new(Arc::clone(&store), messaging_config.clone());
        let tracker = UnreadTracker::new(Arc::clone(&store), messaging_config);
        let health_service = HealthService::new(store, self.config.health.clone());

        let workers =
            Workers { unread_reconcile: UnreadReconcileWorker::new(tracker.clone(), self.config.workers.clone()) };

        Ok(App { services: ServiceContainer { messaging, resolver, tracker, feed }, health_service, workers })
    }
}

/// Flips `shutdown_tx` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }

        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

/// Routes panics through tracing so they reach the configured log sink.
pub fn setup_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map(|l| format!("{}:{}", l.file(), l.line())).unwrap_or_default();
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(panic.location = %location, panic.payload = %payload, "Process panicked");
    }));
}
