use clap::{Args, Parser, ValueEnum};
use std::time::Duration;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub server: ServerConfig,

    #[command(flatten)]
    pub database: DatabaseConfig,

    #[command(flatten)]
    pub auth: AuthConfig,

    #[command(flatten)]
    pub messaging: MessagingConfig,

    #[command(flatten)]
    pub feed: FeedConfig,

    #[command(flatten)]
    pub workers: WorkerConfig,

    #[command(flatten)]
    pub health: HealthConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Args)]
pub struct ServerConfig {
    /// Host to listen on
    #[arg(long = "host", env = "MARKETDZ_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the public API
    #[arg(long = "port", env = "MARKETDZ_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Port for liveness/readiness probes
    #[arg(long = "mgmt-port", env = "MARKETDZ_MGMT_PORT", default_value_t = 9090)]
    pub mgmt_port: u16,

    /// Seconds to wait for background tasks during shutdown
    #[arg(long = "shutdown-timeout-secs", env = "MARKETDZ_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[arg(long = "database-url", env = "MARKETDZ_DATABASE_URL")]
    pub url: String,

    #[arg(long = "db-max-connections", env = "MARKETDZ_DB_MAX_CONNECTIONS", default_value_t = 20)]
    pub max_connections: u32,

    #[arg(long = "db-min-connections", env = "MARKETDZ_DB_MIN_CONNECTIONS", default_value_t = 2)]
    pub min_connections: u32,

    #[arg(long = "db-acquire-timeout-secs", env = "MARKETDZ_DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    pub acquire_timeout_secs: u64,

    #[arg(long = "db-idle-timeout-secs", env = "MARKETDZ_DB_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    #[arg(long = "db-max-lifetime-secs", env = "MARKETDZ_DB_MAX_LIFETIME_SECS", default_value_t = 1800)]
    pub max_lifetime_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct AuthConfig {
    /// Shared secret used to verify identity tokens (HS256)
    #[arg(long = "jwt-secret", env = "MARKETDZ_JWT_SECRET")]
    pub jwt_secret: String,
}

#[derive(Clone, Debug, Args)]
pub struct MessagingConfig {
    /// Number of messages fetched per page
    #[arg(long = "page-size", env = "MARKETDZ_PAGE_SIZE", default_value_t = 20)]
    pub page_size: u32,

    /// Upper bound accepted for a caller-supplied page size
    #[arg(long = "max-page-size", env = "MARKETDZ_MAX_PAGE_SIZE", default_value_t = 100)]
    pub max_page_size: u32,

    /// Maximum message length in characters
    #[arg(long = "max-content-length", env = "MARKETDZ_MAX_CONTENT_LENGTH", default_value_t = 4000)]
    pub max_content_length: usize,

    /// Per-attempt timeout for storage operations
    #[arg(long = "request-timeout-ms", env = "MARKETDZ_REQUEST_TIMEOUT_MS", default_value_t = 8000)]
    pub request_timeout_ms: u64,

    /// Delay before a message received in the viewed conversation is marked read
    #[arg(long = "mark-read-debounce-ms", env = "MARKETDZ_MARK_READ_DEBOUNCE_MS", default_value_t = 1000)]
    pub mark_read_debounce_ms: u64,

    /// Window for matching a live echo to an optimistic entry when no temp id is available
    #[arg(long = "optimistic-match-window-secs", env = "MARKETDZ_OPTIMISTIC_MATCH_WINDOW_SECS", default_value_t = 10)]
    pub optimistic_match_window_secs: u64,

    /// Retries for idempotent reads and read receipts
    #[arg(long = "retry-max-attempts", env = "MARKETDZ_RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: usize,

    #[arg(long = "retry-min-delay-ms", env = "MARKETDZ_RETRY_MIN_DELAY_MS", default_value_t = 200)]
    pub retry_min_delay_ms: u64,

    #[arg(long = "retry-max-delay-ms", env = "MARKETDZ_RETRY_MAX_DELAY_MS", default_value_t = 2000)]
    pub retry_max_delay_ms: u64,

    /// Inbound queue size of each conversation actor
    #[arg(long = "actor-queue-capacity", env = "MARKETDZ_ACTOR_QUEUE_CAPACITY", default_value_t = 64)]
    pub actor_queue_capacity: usize,
}

impl MessagingConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn mark_read_debounce(&self) -> Duration {
        Duration::from_millis(self.mark_read_debounce_ms)
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            max_page_size: 100,
            max_content_length: 4000,
            request_timeout_ms: 8000,
            mark_read_debounce_ms: 1000,
            optimistic_match_window_secs: 10,
            retry_max_attempts: 3,
            retry_min_delay_ms: 200,
            retry_max_delay_ms: 2000,
            actor_queue_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct FeedConfig {
    /// Capacity of each per-topic broadcast channel
    #[arg(long = "feed-channel-capacity", env = "MARKETDZ_FEED_CHANNEL_CAPACITY", default_value_t = 64)]
    pub channel_capacity: usize,

    /// How often idle topic channels are reclaimed
    #[arg(long = "feed-gc-interval-secs", env = "MARKETDZ_FEED_GC_INTERVAL_SECS", default_value_t = 60)]
    pub gc_interval_secs: u64,

    #[arg(long = "feed-min-backoff-ms", env = "MARKETDZ_FEED_MIN_BACKOFF_MS", default_value_t = 500)]
    pub min_backoff_ms: u64,

    #[arg(long = "feed-max-backoff-ms", env = "MARKETDZ_FEED_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub max_backoff_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { channel_capacity: 64, gc_interval_secs: 60, min_backoff_ms: 500, max_backoff_ms: 30_000 }
    }
}

#[derive(Clone, Debug, Args)]
pub struct WorkerConfig {
    /// How often unread counters are recomputed from the messages table
    #[arg(long = "reconcile-interval-secs", env = "MARKETDZ_RECONCILE_INTERVAL_SECS", default_value_t = 300)]
    pub reconcile_interval_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct HealthConfig {
    #[arg(long = "health-db-timeout-ms", env = "MARKETDZ_HEALTH_DB_TIMEOUT_MS", default_value_t = 2000)]
    pub db_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, Args)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint; export is disabled when unset
    #[arg(long = "otlp-endpoint", env = "MARKETDZ_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long = "log-format", env = "MARKETDZ_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }
}
