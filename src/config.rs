use crate::sync::planner::DedupePolicy;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub port: u16,
    pub request_max_bytes: usize,
    pub policy: DedupePolicy,
    pub schedule_max_attempts: u32,
    pub dispatch: DispatchConfig,
    pub executor: ExecutorConfig,
    pub idempotency_ttl_secs: u64,
    pub redis_url: Option<String>,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| text(key).and_then(|value| value.parse::<u64>().ok());
        let count = |key: &str| number(key).and_then(|value| u32::try_from(value).ok());
        // Unrecognised spellings keep the default.
        let flag = |key: &str, default: bool| {
            text(key)
                .and_then(|value| match value.to_ascii_lowercase().as_str() {
                    "1" | "true" | "on" | "yes" => Some(true),
                    "0" | "false" | "off" | "no" => Some(false),
                    _ => None,
                })
                .unwrap_or(default)
        };

        Self {
            database_url: text("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://pim-sync.db?mode=rwc".to_string()),
            database_max_connections: count("DATABASE_MAX_CONNECTIONS")
                .filter(|v| *v > 0)
                .unwrap_or(5),
            port: text("PORT")
                .and_then(|value| value.parse().ok())
                .unwrap_or(8000),
            request_max_bytes: number("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024) as usize,
            policy: DedupePolicy {
                upgrade_on_narrow_collision: flag("SYNC_UPGRADE_NARROW_COLLISIONS", true),
            },
            schedule_max_attempts: count("SYNC_SCHEDULE_MAX_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(5),
            dispatch: DispatchConfig {
                enabled: flag("DISPATCH_ENABLED", true),
                interval: Duration::from_millis(
                    number("DISPATCH_INTERVAL_MS")
                        .filter(|v| *v > 0)
                        .unwrap_or(2000),
                ),
                batch_size: number("DISPATCH_BATCH_SIZE")
                    .filter(|v| *v > 0)
                    .unwrap_or(25) as usize,
                queue_capacity: number("DISPATCH_QUEUE_CAPACITY")
                    .filter(|v| *v > 0)
                    .unwrap_or(64) as usize,
            },
            executor: ExecutorConfig {
                endpoint: text("SYNC_EXECUTOR_URL"),
                token: text("SYNC_EXECUTOR_TOKEN"),
                timeout: Duration::from_secs(number("HTTP_TIMEOUT_SECS").unwrap_or(15)),
                connect_timeout: Duration::from_secs(
                    number("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5),
                ),
            },
            idempotency_ttl_secs: number("IDEMPOTENCY_TTL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(86_400),
            redis_url: text("REDIS_URL"),
            metrics_key: text("METRICS_KEY"),
            openapi_key: text("OPENAPI_KEY"),
        }
    }
}
