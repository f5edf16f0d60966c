//! Retry policy, in-process backoff for synchronous callers, and the
//! coordinator that schedules delayed re-delivery on the retry topic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::{BusError, MessageBus};
use crate::models::message::{BusMessage, RetryEnvelope, Topic};
use crate::tenant::registry::TenantRegistry;

/// One retry policy shape shared by every stage that retries
/// (intake, message delivery, identity lookups, alert webhooks).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ms: 0,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    300_000
}

impl RetryPolicy {
    /// Policy that retries immediately. Used by tests and local mode.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    /// Exponential: base * 2^attempt, capped at `max_delay_ms`, plus jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let raw = base * 2_f64.powi(attempt.min(63) as i32);
        let capped = raw.min(max);

        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };

        Duration::from_millis(capped as u64 + jitter)
    }
}

/// All attempts of a locally retried operation failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts.
///
/// Only for callers that are allowed to wait (the intake request path,
/// identity lookups). Message processing never sleeps; it reschedules.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                warn!(operation, attempt, error = %e, "giving up after final attempt");
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                let wait = policy.backoff(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}...",
                    operation, attempt, max_attempts, e, wait
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Bounded re-delivery through the retry topic.
pub struct RetryCoordinator {
    bus: Arc<dyn MessageBus>,
    registry: TenantRegistry,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(bus: Arc<dyn MessageBus>, registry: TenantRegistry, policy: RetryPolicy) -> Self {
        Self {
            bus,
            registry,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Pipeline-wide limit unless the tenant overrides it.
    pub async fn max_attempts_for(&self, tenant_id: &str) -> u32 {
        self.registry
            .snapshot()
            .await
            .get(tenant_id)
            .and_then(|t| t.max_attempts)
            .unwrap_or(self.policy.max_attempts)
    }

    /// True once the envelope's attempt count exceeds the limit.
    pub async fn should_escalate(&self, envelope: &RetryEnvelope) -> bool {
        envelope.attempt_count > self.max_attempts_for(&envelope.tenant_id).await
    }

    /// Publish the envelope to the retry topic, delayed by its attempt count.
    pub async fn requeue(
        &self,
        envelope: &RetryEnvelope,
        source: &BusMessage,
    ) -> Result<Duration, BusError> {
        let delay = self.policy.backoff(envelope.attempt_count);
        let message = BusMessage::new(
            source.application_properties.clone(),
            source.correlation_id.clone(),
            envelope,
        )?;

        self.bus.schedule(Topic::Retry, &message, delay).await?;

        debug!(
            original_message_id = %envelope.original_message_id,
            retry_message_id = %message.message_id,
            tenant_id = %envelope.tenant_id,
            attempt = envelope.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "requeued for retry"
        );
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 100,
            jitter_ms: 50,
        };
        for _ in 0..20 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_with_backoff_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Exhausted<String>> =
            with_backoff(&RetryPolicy::immediate(6), "flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {}", n))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Exhausted<&str>> =
            with_backoff(&RetryPolicy::immediate(6), "down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("unavailable")
            })
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 6);
        assert_eq!(exhausted.last_error, "unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}
