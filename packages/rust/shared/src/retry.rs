//! Bounded exponential-backoff retry for transient failures.
//!
//! Used by the fetcher, the search wrapper, and the provider router. Only
//! errors for which [`CompIntelError::is_transient`] holds are retried;
//! everything else returns on the first attempt.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{CompIntelError, Result};

/// Retry policy: `max_attempts` total tries with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries and never sleeps.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Zero-delay policy with `max_attempts` tries, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::none()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    ///
    /// A server-supplied retry-after wins over the computed delay when longer;
    /// the result never exceeds `max_delay`.
    pub fn backoff(&self, attempt: u32, err: &CompIntelError) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let computed = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let cap = self.max_delay.as_secs_f64();
        // NaN fails both comparisons and lands on zero.
        let computed = if computed > 0.0 { computed.min(cap) } else { 0.0 };
        let computed = Duration::from_secs_f64(computed);
        match err.retry_after_secs() {
            Some(secs) => Duration::from_secs(secs).max(computed).min(self.max_delay),
            None => computed,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt, &e);
                    tracing::warn!(
                        operation,
                        attempt,
                        max = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy();
        let err = CompIntelError::TransientNetwork("reset".into());
        assert_eq!(p.backoff(1, &err), Duration::from_millis(100));
        assert_eq!(p.backoff(2, &err), Duration::from_millis(200));
        assert_eq!(p.backoff(3, &err), Duration::from_millis(400));
        assert_eq!(p.backoff(10, &err), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_never_panics_on_bad_multiplier() {
        let err = CompIntelError::TransientNetwork("reset".into());
        for multiplier in [-2.0, f64::NAN, f64::INFINITY] {
            let p = RetryPolicy {
                multiplier,
                ..policy()
            };
            for attempt in 1..=4 {
                assert!(p.backoff(attempt, &err) <= p.max_delay);
            }
        }
    }

    #[test]
    fn backoff_honours_retry_after_within_cap() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..policy()
        };
        let err = CompIntelError::RateLimited {
            service: "search".into(),
            retry_after_secs: Some(3),
        };
        assert_eq!(p.backoff(1, &err), Duration::from_secs(3));

        let err = CompIntelError::RateLimited {
            service: "search".into(),
            retry_after_secs: Some(120),
        };
        assert_eq!(p.backoff(1, &err), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CompIntelError::TransientNetwork("503".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.expect("third attempt succeeds"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::immediate(5)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CompIntelError::Network("HTTP 404".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::immediate(2)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CompIntelError::Timeout {
                        operation: "fetch".into(),
                        timeout_secs: 30,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(CompIntelError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
