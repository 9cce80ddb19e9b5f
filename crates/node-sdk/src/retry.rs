//! Retry policy with jittered exponential back-off.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeSdkError, Result};

/// Controls how a failing operation (typically a lifecycle hook) is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoff {
    /// Initial delay before the first retry.
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap).
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Maximum number of consecutive failures before giving up.
    /// `0` means unlimited retries.
    pub max_attempts: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryBackoff {
    /// Compute the delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Add ~25% jitter so that many clients do not retry in lockstep.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    /// Whether the given attempt number exceeds the max.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    /// Delay before retrying after `failures` consecutive failures, or
    /// `None` when `err` must be returned as is.
    pub fn retry_delay(&self, failures: u32, err: &NodeSdkError) -> Option<Duration> {
        if err.is_permanent() || self.should_give_up(failures) {
            return None;
        }
        Some(self.delay_for_attempt(failures.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Permanent errors (see [`NodeSdkError::is_permanent`])
    /// are returned immediately.  The last error is returned when giving up.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            attempt += 1;
            let Some(delay) = self.retry_delay(attempt, &err) else {
                return Err(err);
            };

            tracing::warn!(
                op = %label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy_values() {
        let p = RetryBackoff::default();
        assert_eq!(p.initial_delay, Duration::from_millis(200));
        assert_eq!(p.max_delay, Duration::from_secs(10));
        assert_eq!(p.max_attempts, 3);
    }

    #[test]
    fn delay_grows_with_backoff() {
        let p = RetryBackoff::default();
        let d0 = p.delay_for_attempt(0);
        let d1 = p.delay_for_attempt(1);
        let d2 = p.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let p = RetryBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 10.0,
            max_attempts: 0,
        };
        let d = p.delay_for_attempt(10);
        // Should not exceed max_delay + 25% jitter.
        assert!(d <= Duration::from_millis(37_500));
    }

    #[test]
    fn should_give_up_when_limited() {
        let p = RetryBackoff {
            max_attempts: 5,
            ..Default::default()
        };
        assert!(!p.should_give_up(4));
        assert!(p.should_give_up(5));
        assert!(p.should_give_up(6));
    }

    #[test]
    fn unlimited_never_gives_up() {
        let p = RetryBackoff {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(!p.should_give_up(1_000_000));
    }

    #[test]
    fn parses_from_toml_in_milliseconds() {
        let p: RetryBackoff = toml::from_str("initial_delay_ms = 50\nmax_attempts = 7").unwrap();
        assert_eq!(p.initial_delay, Duration::from_millis(50));
        assert_eq!(p.max_attempts, 7);
        assert_eq!(p.max_delay, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let out = RetryBackoff::default()
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(NodeSdkError::Connection("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let err = RetryBackoff::default()
            .run("down", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NodeSdkError::Connection("refused".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NodeSdkError::Connection(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_never_retries_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let err = RetryBackoff::default()
            .run("fatal", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NodeSdkError::Fatal("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NodeSdkError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
