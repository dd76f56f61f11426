//! Bounded retry with exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::parse_env;
use crate::error::ConfigError;

/// Attempt ceiling and backoff bounds for one collaborator call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_attempts: u32 = parse_env("TRIAGE_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_RETRY_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let base_ms: u64 = parse_env(
            "TRIAGE_RETRY_BASE_MS",
            defaults.base_delay.as_millis() as u64,
        )?;
        let max_ms: u64 = parse_env("TRIAGE_RETRY_MAX_MS", defaults.max_delay.as_millis() as u64)?;

        Ok(Self {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
        })
    }

    /// No waiting between attempts (for tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the delay after failed attempt `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        raw.min(self.max_delay)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(jittered)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// Each attempt is bounded by `timeout`; a timeout counts as a failed attempt.
/// On exhaustion the last error is returned as text.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    label: &str,
    mut op: F,
) -> Result<T, String>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {timeout:?}"),
        }

        if attempt < attempts {
            let delay = policy.backoff(attempt);
            warn!(
                call = label,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(format!("{label} failed after {attempts} attempts: {last_error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let ceiling = policy.backoff_ceiling(attempt);
            let delay = policy.backoff(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, String> = with_retry(
            &RetryPolicy::immediate(3),
            Duration::from_secs(1),
            "send",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset")
                } else {
                    Ok("ack")
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "ack");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_ceiling_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(
            &RetryPolicy::immediate(2),
            Duration::from_secs(1),
            "generate",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("boom {n}"))
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.contains("boom 1"), "{err}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let result: Result<(), String> = with_retry(
            &RetryPolicy::immediate(2),
            Duration::from_millis(10),
            "send",
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), String>(())
            },
        )
        .await;
        assert!(result.unwrap_err().contains("timed out"));
    }
}
