use std::str::FromStr;

use serde::Deserialize;

use crate::error::AppError;

const BROKER_SCHEMES: [&str; 4] = ["amqp://", "amqps://", "redis://", "rediss://"];
const SMTP_TLS_MODES: [&str; 3] = ["disabled", "opportunistic", "required"];

/// Global worker configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string used by the dedup store
    pub redis_url: String,

    /// Broker connection string (defaults to `RABBITMQ_URL`, then `redis_url`); `amqp://` or `amqps://`
    /// selects RabbitMQ, `redis://` or `rediss://` the Redis-list broker
    pub broker_url: String,

    /// Stable identity of this worker; names its unacknowledged set on the broker
    pub worker_id: String,

    /// Direct exchange the live and dead-letter queues are bound to
    pub exchange: String,

    /// Live queue name, also its routing key
    pub queue: String,

    /// Dead-letter queue name, also its routing key
    pub dead_letter_queue: String,

    /// Consecutive failures before a provider's circuit opens (default: 5)
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls, in milliseconds (default: 10000)
    pub recovery_time_ms: u64,

    /// Attempts before a request is dead-lettered (default: 4)
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds (default: 2000)
    pub base_delay_ms: u64,

    /// Retention of dedup markers in seconds (default: 86400 = 24h)
    pub dedup_ttl_secs: u64,

    /// Treat dedup store failures as "not a duplicate" (default: true)
    pub dedup_fail_open: bool,

    /// Maximum number of messages held unacknowledged at once (default: 16)
    pub worker_concurrency: usize,

    /// Time in-flight attempts get to finish after shutdown, in milliseconds (default: 10000)
    pub shutdown_grace_ms: u64,

    /// How long a message that cannot be handled now is held before it is requeued,
    /// in milliseconds (default: 5000)
    pub requeue_delay_ms: u64,

    /// Pause after a failed broker receive, in milliseconds (default: 2000)
    pub broker_error_backoff_ms: u64,

    /// Broker availability checks before giving up at startup (default: 30)
    pub broker_wait_retries: u32,

    /// Interval between broker availability checks, in milliseconds (default: 2000)
    pub broker_wait_interval_ms: u64,

    /// Transport priority order, e.g. `["resend", "smtp"]`
    pub providers: Vec<String>,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Resend API base URL
    pub resend_api_url: String,

    /// Email sender address
    pub email_from: Option<String>,

    /// SMTP relay host for the fallback transport
    pub smtp_host: Option<String>,

    /// SMTP relay port (default: 25)
    pub smtp_port: u16,

    /// SMTP username, enables `AUTH PLAIN` together with `smtp_pass`
    pub smtp_user: Option<String>,

    /// SMTP password
    pub smtp_pass: Option<String>,

    /// Upper bound on one SMTP session, in milliseconds (default: 30000)
    pub smtp_timeout_ms: u64,

    /// `STARTTLS` policy: `disabled`, `opportunistic` or `required` (default: opportunistic)
    pub smtp_tls: String,

    /// Allow `AUTH` on a connection that is not encrypted (default: false)
    pub smtp_allow_insecure_auth: bool,

    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        Ok(Self {
            broker_url: std::env::var("BROKER_URL")
                .or_else(|_| std::env::var("RABBITMQ_URL"))
                .unwrap_or_else(|_| redis_url.clone()),
            redis_url,
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| "email-worker-001".to_string()),
            exchange: std::env::var("EXCHANGE")
                .unwrap_or_else(|_| "notifications.direct".to_string()),
            queue: std::env::var("QUEUE").unwrap_or_else(|_| "email.queue".to_string()),
            dead_letter_queue: std::env::var("DEAD_LETTER_QUEUE")
                .unwrap_or_else(|_| "failed.queue".to_string()),
            failure_threshold: parse_var("FAILURE_THRESHOLD", 5)?,
            recovery_time_ms: parse_var("RECOVERY_TIME_MS", 10_000)?,
            max_retries: parse_var("MAX_RETRIES", 4)?,
            base_delay_ms: parse_var("BASE_DELAY_MS", 2_000)?,
            dedup_ttl_secs: parse_var("DEDUP_TTL_SECS", 24 * 60 * 60)?,
            dedup_fail_open: parse_var("DEDUP_FAIL_OPEN", true)?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", 16)?,
            shutdown_grace_ms: parse_var("SHUTDOWN_GRACE_MS", 10_000)?,
            requeue_delay_ms: parse_var("REQUEUE_DELAY_MS", 5_000)?,
            broker_error_backoff_ms: parse_var("BROKER_ERROR_BACKOFF_MS", 2_000)?,
            broker_wait_retries: parse_var("BROKER_WAIT_RETRIES", 30)?,
            broker_wait_interval_ms: parse_var("BROKER_WAIT_INTERVAL_MS", 2_000)?,
            providers: parse_list(
                &std::env::var("PROVIDERS").unwrap_or_else(|_| "resend,smtp".to_string()),
            ),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            email_from: std::env::var("EMAIL_FROM").ok(),
            smtp_host: std::env::var("SMTP_HOST").ok(),
            smtp_port: parse_var("SMTP_PORT", 25)?,
            smtp_user: std::env::var("SMTP_USER").ok(),
            smtp_pass: std::env::var("SMTP_PASS").ok(),
            smtp_timeout_ms: parse_var("SMTP_TIMEOUT_MS", 30_000)?,
            smtp_tls: std::env::var("SMTP_TLS")
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_else(|_| "opportunistic".to_string()),
            smtp_allow_insecure_auth: parse_var("SMTP_ALLOW_INSECURE_AUTH", false)?,
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

impl AppConfig {
    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_retries == 0 {
            return Err(AppError::Config("MAX_RETRIES must be at least 1".into()));
        }
        if self.failure_threshold == 0 {
            return Err(AppError::Config("FAILURE_THRESHOLD must be at least 1".into()));
        }
        if self.worker_concurrency == 0 {
            return Err(AppError::Config("WORKER_CONCURRENCY must be at least 1".into()));
        }
        if self.providers.is_empty() {
            return Err(AppError::Config("PROVIDERS must name at least one transport".into()));
        }
        if !BROKER_SCHEMES
            .iter()
            .any(|scheme| self.broker_url.starts_with(scheme))
        {
            return Err(AppError::Config(format!(
                "BROKER_URL must start with one of {}",
                BROKER_SCHEMES.join(", ")
            )));
        }
        if !SMTP_TLS_MODES.contains(&self.smtp_tls.as_str()) {
            return Err(AppError::Config(format!(
                "SMTP_TLS must be one of {}, got {}",
                SMTP_TLS_MODES.join(", "),
                self.smtp_tls
            )));
        }
        if self.queue == self.dead_letter_queue {
            return Err(AppError::Config(format!(
                "QUEUE and DEAD_LETTER_QUEUE must differ (both are {})",
                self.queue
            )));
        }
        Ok(())
    }
}

/// Read `key` and parse it, falling back to `default` when it is unset.
fn parse_var<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{key} must be a valid {}",
                std::any::type_name::<T>().rsplit("::").next().unwrap_or("value")
            )
        }),
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, dropping blanks and normalising case.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
