use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::providers::ProviderType;
use crate::queue::Priority;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub webhook: WebhookConfig,
    pub oauth: OAuthConfig,
    pub conflict: ConflictConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Retry, retention and concurrency policy of one priority lane.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub concurrency: usize,
    pub attempts: u32,
    pub backoff_base: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub high: LaneConfig,
    pub normal: LaneConfig,
    pub low: LaneConfig,
    /// Lease held by a worker on an active job. Must outlast a slow full sync;
    /// the worker renews it while the job runs.
    pub lock_duration: Duration,
    pub poll_interval: Duration,
    pub stalled_check_interval: Duration,
}

impl QueueConfig {
    pub fn lane(&self, priority: Priority) -> &LaneConfig {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high: LaneConfig {
                concurrency: 10,
                attempts: 5,
                backoff_base: Duration::from_secs(2),
                keep_completed: 100,
                keep_failed: 500,
            },
            normal: LaneConfig {
                concurrency: 5,
                attempts: 3,
                backoff_base: Duration::from_secs(5),
                keep_completed: 100,
                keep_failed: 500,
            },
            low: LaneConfig {
                concurrency: 2,
                attempts: 2,
                backoff_base: Duration::from_secs(10),
                keep_completed: 50,
                keep_failed: 200,
            },
            lock_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            stalled_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub batch_size: u64,
    /// Consecutive failures after which a provider is deactivated.
    pub max_error_streak: i32,
    /// Smoothing factor of the activity-rate moving average.
    pub activity_alpha: f64,
    /// Activity rate at which a recently synced mailbox stays in the normal lane.
    pub busy_activity_rate: f64,
    pub max_messages: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 100,
            max_error_streak: 5,
            activity_alpha: 0.3,
            busy_activity_rate: 5.0,
            max_messages: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Public base URL providers post notifications to.
    pub public_url: String,
    pub renewal_window: Duration,
    pub renewal_interval: Duration,
    pub subscription_ttl: Duration,
    pub gmail_topic: Option<String>,
    pub gmail_push_token: String,
    /// Key used for constant-time comparison of client secrets.
    pub verify_key: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:3000".to_string(),
            renewal_window: Duration::from_secs(24 * 3600),
            renewal_interval: Duration::from_secs(3600),
            subscription_ttl: Duration::from_secs(70 * 3600),
            gmail_topic: None,
            gmail_push_token: String::new(),
            verify_key: "mailmirror-webhook".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub google: OAuthClient,
    pub microsoft: OAuthClient,
    /// Base64-encoded 32-byte key sealing stored credentials.
    pub credentials_key: String,
    pub gmail_api_base: String,
    pub graph_api_base: String,
}

#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Provider ranking for PRIORITY_BASED resolution, highest first.
    pub provider_priority: Vec<ProviderType>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec![ProviderType::Gmail, ProviderType::Outlook, ProviderType::Imap],
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let queue_defaults = QueueConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let webhook_defaults = WebhookConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 3000)?,
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")?,
            },
            queue: QueueConfig {
                high: lane_from_env("HIGH", &queue_defaults.high)?,
                normal: lane_from_env("NORMAL", &queue_defaults.normal)?,
                low: lane_from_env("LOW", &queue_defaults.low)?,
                lock_duration: Duration::from_secs(env_parse("QUEUE_LOCK_DURATION_SECS", 300)?),
                poll_interval: Duration::from_millis(env_parse("QUEUE_POLL_INTERVAL_MS", 1000)?),
                stalled_check_interval: Duration::from_secs(env_parse(
                    "QUEUE_STALLED_CHECK_SECS",
                    30,
                )?),
            },
            scheduler: SchedulerConfig {
                interval: Duration::from_secs(env_parse("SCHEDULER_INTERVAL_SECS", 300)?),
                batch_size: env_parse("SCHEDULER_BATCH_SIZE", scheduler_defaults.batch_size)?,
                max_error_streak: env_parse(
                    "SCHEDULER_MAX_ERROR_STREAK",
                    scheduler_defaults.max_error_streak,
                )?,
                activity_alpha: env_parse(
                    "SCHEDULER_ACTIVITY_ALPHA",
                    scheduler_defaults.activity_alpha,
                )?,
                busy_activity_rate: env_parse(
                    "SCHEDULER_BUSY_ACTIVITY_RATE",
                    scheduler_defaults.busy_activity_rate,
                )?,
                max_messages: env_parse("SYNC_MAX_MESSAGES", scheduler_defaults.max_messages)?,
            },
            webhook: WebhookConfig {
                public_url: public_url(&env_or(
                    "WEBHOOK_PUBLIC_URL",
                    &webhook_defaults.public_url,
                ))?,
                renewal_window: Duration::from_secs(
                    env_parse::<u64>("WEBHOOK_RENEWAL_WINDOW_HOURS", 24)? * 3600,
                ),
                renewal_interval: Duration::from_secs(env_parse(
                    "WEBHOOK_RENEWAL_INTERVAL_SECS",
                    3600,
                )?),
                subscription_ttl: Duration::from_secs(
                    env_parse::<u64>("WEBHOOK_SUBSCRIPTION_TTL_HOURS", 70)? * 3600,
                ),
                gmail_topic: std::env::var("GMAIL_PUBSUB_TOPIC").ok(),
                gmail_push_token: env_or("GMAIL_PUSH_TOKEN", ""),
                verify_key: env_or("WEBHOOK_VERIFY_KEY", &webhook_defaults.verify_key),
            },
            oauth: OAuthConfig {
                google: OAuthClient {
                    client_id: env_or("GOOGLE_CLIENT_ID", ""),
                    client_secret: env_or("GOOGLE_CLIENT_SECRET", ""),
                    token_url: env_or("GOOGLE_TOKEN_URL", "https://oauth2.googleapis.com/token"),
                },
                microsoft: OAuthClient {
                    client_id: env_or("MICROSOFT_CLIENT_ID", ""),
                    client_secret: env_or("MICROSOFT_CLIENT_SECRET", ""),
                    token_url: env_or(
                        "MICROSOFT_TOKEN_URL",
                        "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                    ),
                },
                credentials_key: std::env::var("CREDENTIALS_KEY")?,
                gmail_api_base: env_or(
                    "GMAIL_API_BASE",
                    "https://gmail.googleapis.com/gmail/v1/users/me",
                ),
                graph_api_base: env_or("GRAPH_API_BASE", "https://graph.microsoft.com/v1.0"),
            },
            conflict: ConflictConfig {
                provider_priority: parse_priority_list(&env_or(
                    "CONFLICT_PROVIDER_PRIORITY",
                    "gmail,outlook,imap",
                ))?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => Ok(raw.trim().parse()?),
        Err(_) => Ok(default),
    }
}

fn lane_from_env(prefix: &str, defaults: &LaneConfig) -> anyhow::Result<LaneConfig> {
    Ok(LaneConfig {
        concurrency: env_parse(&format!("QUEUE_{}_CONCURRENCY", prefix), defaults.concurrency)?,
        attempts: env_parse(&format!("QUEUE_{}_ATTEMPTS", prefix), defaults.attempts)?,
        backoff_base: Duration::from_millis(env_parse(
            &format!("QUEUE_{}_BACKOFF_MS", prefix),
            defaults.backoff_base.as_millis() as u64,
        )?),
        keep_completed: env_parse(
            &format!("QUEUE_{}_KEEP_COMPLETED", prefix),
            defaults.keep_completed,
        )?,
        keep_failed: env_parse(&format!("QUEUE_{}_KEEP_FAILED", prefix), defaults.keep_failed)?,
    })
}

/// Validated notification base URL without a trailing slash.
fn public_url(raw: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("WEBHOOK_PUBLIC_URL '{}' is invalid: {}", raw, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("WEBHOOK_PUBLIC_URL must be http(s), got '{}'", parsed.scheme());
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn parse_priority_list(raw: &str) -> anyhow::Result<Vec<ProviderType>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ProviderType>().map_err(anyhow::Error::from))
        .collect()
}
