//! Retry with exponential backoff
//!
//! Only errors classified as retryable ([`CarelinkError::is_retryable`]) are
//! retried. A server-supplied `Retry-After` hint replaces the computed delay.

use crate::config::RetryConfig;
use crate::domain::{CarelinkError, Result};
use crate::log_retry_attempt;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy from a `[*.retry]` config section
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Doubling policy without jitter: `initial, 2*initial, 4*initial, …` capped
    pub fn doubling(max_attempts: u32, initial: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: initial,
            max_delay: cap,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `retry`, with jitter of up to half the base delay
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as u64 / 2).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(self.max_delay.max(base))
    }

    /// Delay to wait after `error` on retry number `retry`
    pub fn delay_after(&self, error: &CarelinkError, retry: u32) -> Duration {
        error.retry_after().unwrap_or_else(|| self.delay(retry))
    }

    /// Run `operation` until it succeeds, fails terminally, or the budget is spent
    ///
    /// The last error is returned unchanged when the budget is exhausted.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Retry budget exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_after(&e, attempt);
                    log_retry_attempt!(attempt, self.max_attempts, delay.as_millis() as u64, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Parse a `Retry-After` header value
///
/// Accepts delta-seconds (`"120"`) and HTTP-dates
/// (`"Wed, 21 Oct 2026 07:28:00 GMT"`). A date in the past yields zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::doubling(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_doubling_schedule_capped() {
        let policy =
            RetryPolicy::doubling(10, Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (1..=8).map(|n| policy.base_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::doubling(5, Duration::from_millis(100), Duration::from_secs(10))
        };
        for _ in 0..50 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = fast_policy(3);
        let err = CarelinkError::RateLimited {
            target: "fhir".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.delay_after(&err, 1), Duration::from_secs(7));
    }

    #[test]
    fn test_parse_retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2026, 10, 21, 7, 27, 30).unwrap();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(4)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CarelinkError::TransientNetwork {
                        target: "x".into(),
                        message: "503".into(),
                    })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_terminal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(4)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CarelinkError::Rejected {
                    target: "x".into(),
                    status: 400,
                    message: "bad".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(CarelinkError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_at_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CarelinkError::TransientNetwork {
                    target: "x".into(),
                    message: "timeout".into(),
                })
            })
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
