//! Retry policy for provider invocations.
//!
//! Decides, per classified failure, whether the same provider gets another
//! attempt and how long to wait before it.

use std::time::Duration;

use rand::Rng;

use crate::config::MarketDataConfig;
use crate::errors::{ProviderError, ProviderErrorKind, RetryClass};

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try the same provider again.
    RetryAfter(Duration),
    /// Stop retrying this provider.
    GiveUp,
}

/// Exponential backoff with jitter, bounded by an attempt budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter,
        }
    }

    pub fn from_config(config: &MarketDataConfig) -> Self {
        Self::new(
            config.max_retries,
            config.base_retry_delay(),
            config.max_retry_delay(),
            config.retry_jitter(),
        )
    }

    /// Total invocations allowed per provider, first try included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a failure of `kind` after `attempt` invocations (1-based) may
    /// be retried at all, ignoring deadlines.
    pub fn should_retry(&self, kind: &ProviderErrorKind, attempt: u32) -> bool {
        attempt < self.max_attempts() && kind.retry_class() != RetryClass::Never
    }

    /// Backoff before the retry that follows attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1) + uniform(0, jitter), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.max_delay.as_millis() as u64;
        let jitter_ms = self.jitter.as_millis() as u64;

        let exponential = 2u64.saturating_pow(attempt - 1);
        let delay_ms = base_ms.saturating_mul(exponential);

        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };

        Duration::from_millis(delay_ms.saturating_add(jitter).min(cap_ms))
    }

    /// Decide how to follow up on `error` after `attempt` invocations.
    ///
    /// Transient failures always back off; the caller checks its deadline
    /// before sleeping. A throttled provider is only retried when its
    /// requested wait fits in `remaining` (or in the delay cap when there is
    /// no deadline), otherwise it is treated as a hard failure.
    pub fn decide(
        &self,
        error: &ProviderError,
        attempt: u32,
        remaining: Option<Duration>,
    ) -> RetryDecision {
        if !self.should_retry(&error.kind, attempt) {
            return RetryDecision::GiveUp;
        }

        match error.retry_class() {
            RetryClass::WithBackoff => RetryDecision::RetryAfter(self.delay_for(attempt)),
            RetryClass::AfterRetryAfter => {
                let wait = error
                    .kind
                    .retry_after()
                    .unwrap_or_else(|| self.delay_for(attempt));
                let budget = remaining.unwrap_or(self.max_delay);

                if wait <= budget {
                    RetryDecision::RetryAfter(wait)
                } else {
                    RetryDecision::GiveUp
                }
            }
            RetryClass::Never => RetryDecision::GiveUp,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MarketDataConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, jitter_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(500),
            Duration::from_millis(10_000),
            Duration::from_millis(jitter_ms),
        )
    }

    fn error(kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new("TEST", kind, "boom")
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = policy(10, 0);
        let delays: Vec<u64> = (1..=7)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = policy(3, 250);
        for _ in 0..100 {
            let delay = policy.delay_for(2).as_millis();
            assert!((1_000..=1_250).contains(&delay), "delay {} out of range", delay);
        }
        // Jitter never pushes past the cap.
        assert_eq!(policy.delay_for(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = policy(3, 0);
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(&ProviderErrorKind::Timeout, 3));
        assert!(!policy.should_retry(&ProviderErrorKind::Timeout, 4));

        let no_retries = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, Duration::ZERO);
        assert!(!no_retries.should_retry(&ProviderErrorKind::Timeout, 1));
    }

    #[test]
    fn test_never_retry_kinds() {
        let policy = policy(3, 0);
        for kind in [
            ProviderErrorKind::AuthInvalid,
            ProviderErrorKind::ClientError { code: 400 },
            ProviderErrorKind::NotSupported,
            ProviderErrorKind::Unknown,
        ] {
            assert_eq!(policy.decide(&error(kind), 1, None), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_transient_kinds_back_off() {
        let policy = policy(3, 0);
        for kind in [
            ProviderErrorKind::Timeout,
            ProviderErrorKind::NetworkError,
            ProviderErrorKind::ServiceUnavailable,
        ] {
            assert_eq!(
                policy.decide(&error(kind), 2, Some(Duration::from_millis(10))),
                RetryDecision::RetryAfter(Duration::from_millis(1_000))
            );
        }
    }

    #[test]
    fn test_rate_limited_respects_deadline() {
        let policy = policy(3, 0);
        let throttled = error(ProviderErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        });

        assert_eq!(
            policy.decide(&throttled, 1, Some(Duration::from_secs(5))),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(&throttled, 1, Some(Duration::from_secs(1))),
            RetryDecision::GiveUp
        );
        // Without a deadline the wait must fit under the delay cap.
        assert_eq!(
            policy.decide(&throttled, 1, None),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        let long_wait = error(ProviderErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        });
        assert_eq!(policy.decide(&long_wait, 1, None), RetryDecision::GiveUp);
    }

    #[test]
    fn test_rate_limited_without_retry_after_uses_backoff() {
        let policy = policy(3, 0);
        let throttled = error(ProviderErrorKind::ClientError { code: 429 });
        assert_eq!(
            policy.decide(&throttled, 1, Some(Duration::from_secs(1))),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
    }
}
