use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Empty selects the in-memory store.
    pub database_url: String,
    /// Empty selects the in-process bus.
    pub redis_url: String,
    pub payload_store_url: Option<String>,
    /// YAML tenant catalog. When unset, tenants are read from the database.
    pub tenants_file: Option<String>,
    pub tenant_refresh_secs: u64,
    pub worker_count: usize,
    /// Deliveries each worker locks per receive.
    pub worker_batch_size: usize,
    pub worker_idle_ms: u64,
    /// Pipeline-wide delivery attempt limit; tenants may override it.
    pub max_delivery_attempts: u32,
    /// Bus deliveries of one message before a worker dead-letters it because
    /// processing keeps erroring.
    pub max_delivery_count: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub intake_retry_attempts: u32,
    pub intake_retry_base_ms: u64,
    pub lock_duration_secs: u64,
    pub identity_service_url: Option<String>,
    pub identity_timeout_ms: u64,
    pub identity_max_retries: u32,
    pub identity_cache_ttl_secs: u64,
    pub alert_slack_webhook_url: Option<String>,
    /// Comma-separated list of webhook URLs notified on dead-letter.
    pub alert_webhook_urls: Vec<String>,
    pub alert_webhook_secret: Option<String>,
}

impl Config {
    pub fn delivery_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_attempts,
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_ms,
            jitter_ms: self.retry_base_ms / 4,
        }
    }

    pub fn redelivery_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_count,
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_ms,
            jitter_ms: self.retry_base_ms / 4,
        }
    }

    /// Intake waits in-process, so its delay doubles per attempt from
    /// `intake_retry_base_ms` (2^attempt seconds with the default).
    pub fn intake_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.intake_retry_attempts,
            base_delay_ms: self.intake_retry_base_ms,
            max_delay_ms: self.intake_retry_base_ms.saturating_mul(64),
            jitter_ms: 0,
        }
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }

    pub fn worker_idle_wait(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms)
    }

    pub fn tenant_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.tenant_refresh_secs.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let config = Config {
        port: env_parse("PIPELINE_PORT", 8080),
        database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
        redis_url: std::env::var("REDIS_URL").unwrap_or_default(),
        payload_store_url: env_opt("PAYLOAD_STORE_URL"),
        tenants_file: env_opt("TENANTS_FILE"),
        tenant_refresh_secs: env_parse("TENANT_REFRESH_SECS", 300),
        worker_count: env_parse("WORKER_COUNT", 4),
        worker_batch_size: env_parse("WORKER_BATCH_SIZE", 10),
        worker_idle_ms: env_parse("WORKER_IDLE_MS", 500),
        max_delivery_attempts: env_parse("MAX_DELIVERY_ATTEMPTS", 3),
        max_delivery_count: env_parse("MAX_DELIVERY_COUNT", 10),
        retry_base_ms: env_parse("RETRY_BASE_MS", 1_000),
        retry_max_ms: env_parse("RETRY_MAX_MS", 300_000),
        intake_retry_attempts: env_parse("INTAKE_RETRY_ATTEMPTS", 6),
        intake_retry_base_ms: env_parse("INTAKE_RETRY_BASE_MS", 1_000),
        lock_duration_secs: env_parse("LOCK_DURATION_SECS", 60),
        identity_service_url: env_opt("IDENTITY_SERVICE_URL"),
        identity_timeout_ms: env_parse("IDENTITY_TIMEOUT_MS", 2_000),
        identity_max_retries: env_parse("IDENTITY_MAX_RETRIES", 2),
        identity_cache_ttl_secs: env_parse("IDENTITY_CACHE_TTL_SECS", 600),
        alert_slack_webhook_url: env_opt("ALERT_SLACK_WEBHOOK_URL"),
        alert_webhook_urls: std::env::var("ALERT_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        alert_webhook_secret: env_opt("ALERT_WEBHOOK_SECRET"),
    };

    if config.max_delivery_attempts == 0 {
        anyhow::bail!("MAX_DELIVERY_ATTEMPTS must be at least 1");
    }
    if config.database_url.is_empty() && config.tenants_file.is_none() {
        eprintln!("⚠️  Neither DATABASE_URL nor TENANTS_FILE is set, starting with an empty tenant catalog.");
    }

    Ok(config)
}
